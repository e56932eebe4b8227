//! Dispatch loop
//!
//! [`Tunnel`] is a cheap clonable handle over shared state. Ports and
//! handlers can be registered at any time from any task; the loop reads a
//! snapshot of the handler chain per message.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meshtun_core::{Message, PortAddr, TunnelConfig};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::{MessageHandler, Port, Result, TunnelError};

/// Lifecycle of the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Running,
    Draining,
    Terminated,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct PortTable {
    ports: HashMap<PortAddr, Arc<Port>>,
    fallback: Option<Arc<Port>>,
}

struct LoopChannels {
    input: mpsc::Receiver<Message>,
    shutdown: mpsc::Receiver<()>,
}

struct Inner {
    config: TunnelConfig,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    table: Mutex<PortTable>,
    input_tx: mpsc::Sender<Message>,
    shutdown_tx: mpsc::Sender<()>,
    channels: Mutex<Option<LoopChannels>>,
    state: Mutex<TunnelState>,
    dispatched: AtomicU64,
}

/// Handle to a dispatch engine
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        let (input_tx, input) = mpsc::channel(config.inbound_queue.max(1));
        let (shutdown_tx, shutdown) = mpsc::channel(1);

        Self {
            inner: Arc::new(Inner {
                config,
                handlers: RwLock::new(Vec::new()),
                table: Mutex::new(PortTable::default()),
                input_tx,
                shutdown_tx,
                channels: Mutex::new(Some(LoopChannels { input, shutdown })),
                state: Mutex::new(TunnelState::Idle),
                dispatched: AtomicU64::new(0),
            }),
        }
    }

    /// Append a handler. The newest handler sees each message first.
    pub fn add_message_handler(&self, handler: impl MessageHandler + 'static) {
        let mut handlers = self.inner.handlers.write();
        debug!("Registered handler {} ({} total)", handler.name(), handlers.len() + 1);
        handlers.push(Arc::new(handler));
    }

    /// Register a port under `addr`, replacing and closing any previous one.
    ///
    /// A fallback port also becomes the target for messages no port is
    /// registered for; the latest fallback registration wins.
    ///
    /// Once the loop has begun draining, the port is returned already closed
    /// and is not registered.
    pub fn add_port(&self, addr: impl Into<PortAddr>, fallback: bool) -> Arc<Port> {
        let addr = addr.into();
        let port = Port::new(
            addr.clone(),
            fallback,
            self.inner.input_tx.clone(),
            self.inner.config.port_buffer,
        );

        let replaced = {
            let mut table = self.inner.table.lock();
            // Checked under the table lock so drain cannot miss this port
            let state = *self.inner.state.lock();
            if matches!(state, TunnelState::Draining | TunnelState::Terminated) {
                drop(table);
                warn!("Refusing port {}: tunnel is {}", addr, state);
                port.close();
                return port;
            }
            let replaced = table.ports.insert(addr.clone(), port.clone());
            if fallback {
                table.fallback = Some(port.clone());
            } else if let (Some(old), Some(current)) = (&replaced, &table.fallback) {
                if Arc::ptr_eq(old, current) {
                    table.fallback = None;
                }
            }
            replaced
        };

        if let Some(old) = replaced {
            info!("Replacing port {}", addr);
            old.close();
        }
        if fallback {
            info!("Added fallback port {}", addr);
        } else {
            info!("Added port {}", addr);
        }
        port
    }

    /// Unregister and close the port at `addr`
    pub fn retire_port(&self, addr: &str) -> Result<Arc<Port>> {
        let port = {
            let mut table = self.inner.table.lock();
            let port = table
                .ports
                .remove(addr)
                .ok_or_else(|| TunnelError::PortNotFound(addr.to_string()))?;
            if table
                .fallback
                .as_ref()
                .is_some_and(|fallback| Arc::ptr_eq(fallback, &port))
            {
                table.fallback = None;
            }
            port
        };

        port.close();
        info!("Retired port {}", addr);
        Ok(port)
    }

    /// Same as [`Tunnel::retire_port`]
    pub fn remove_port(&self, addr: &str) -> Result<Arc<Port>> {
        self.retire_port(addr)
    }

    pub fn get_port(&self, addr: &str) -> Option<Arc<Port>> {
        self.inner.table.lock().ports.get(addr).cloned()
    }

    pub fn get_fallback_port(&self) -> Option<Arc<Port>> {
        self.inner.table.lock().fallback.clone()
    }

    /// Addresses of all registered ports
    pub fn ports(&self) -> Vec<PortAddr> {
        self.inner.table.lock().ports.keys().cloned().collect()
    }

    pub fn port_count(&self) -> usize {
        self.inner.table.lock().ports.len()
    }

    pub fn state(&self) -> TunnelState {
        *self.inner.state.lock()
    }

    /// Messages taken off the inbound queue so far
    pub fn dispatched(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Spawn the dispatch loop.
    ///
    /// The returned channel yields exactly one error when the loop ends:
    /// `Closed` after [`Tunnel::close`], the handler's error after a handler
    /// failure, or `LoopPanicked`. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<oneshot::Receiver<TunnelError>> {
        let channels = self
            .inner
            .channels
            .lock()
            .take()
            .ok_or(TunnelError::AlreadyStarted)?;
        *self.inner.state.lock() = TunnelState::Running;

        let (result_tx, result_rx) = oneshot::channel();
        let tunnel = self.clone();
        let handle = tokio::spawn(async move { tunnel.run(channels).await });

        let supervisor = self.clone();
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Dispatch loop panicked: {}", e);
                    supervisor.drain();
                    TunnelError::LoopPanicked(e.to_string())
                }
            };
            *supervisor.inner.state.lock() = TunnelState::Terminated;
            let _ = result_tx.send(outcome);
        });

        info!("Tunnel started");
        Ok(result_rx)
    }

    /// Ask the loop to stop. Never blocks; does nothing if the loop is not
    /// running or a stop is already pending.
    pub fn close(&self) {
        if self.state() != TunnelState::Running {
            return;
        }
        if self.inner.shutdown_tx.try_send(()).is_ok() {
            debug!("Tunnel close requested");
        }
    }

    async fn run(&self, mut channels: LoopChannels) -> TunnelError {
        let period = self.inner.config.diagnostic_interval();
        let mut ticker = interval_at(Instant::now() + period, period);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = channels.shutdown.recv() => {
                    info!("Tunnel shutting down");
                    break TunnelError::Closed;
                }
                Some(msg) = channels.input.recv() => {
                    if let Err(e) = self.dispatch(msg).await {
                        error!("Tunnel stopped: {}", e);
                        break e;
                    }
                }
                _ = ticker.tick() => {
                    self.report();
                }
            }
        };

        self.drain();
        outcome
    }

    /// Run one message through the chain, newest handler first
    async fn dispatch(&self, msg: Message) -> Result<()> {
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        let handlers = self.inner.handlers.read().clone();

        for handler in handlers.iter().rev() {
            match handler.handle(self, &msg).await {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(e) => {
                    warn!("Handler {} failed on message to {}: {}", handler.name(), msg.dst, e);
                    return Err(TunnelError::Handler(e));
                }
            }
        }

        debug!("Dropping unclaimed message {} -> {}", msg.src, msg.dst);
        Ok(())
    }

    /// Close and unregister every port
    fn drain(&self) {
        *self.inner.state.lock() = TunnelState::Draining;

        let ports = {
            let mut table = self.inner.table.lock();
            table.fallback = None;
            std::mem::take(&mut table.ports)
        };
        for (addr, port) in ports {
            if port.close() {
                info!("Closed port {}", addr);
            }
        }
    }

    fn report(&self) {
        let tasks = tokio::runtime::Handle::current()
            .metrics()
            .num_alive_tasks();
        info!(
            "Tunnel alive: {} ports, {} messages dispatched, {} tasks",
            self.port_count(),
            self.dispatched(),
            tasks
        );
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("state", &self.state())
            .field("ports", &self.port_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler_fn, HandlerResult};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn tunnel() -> Tunnel {
        Tunnel::new(TunnelConfig::default())
    }

    fn msg(dst: &str) -> Message {
        Message::new(dst, Bytes::from_static(b"payload"))
    }

    /// Forwards every message to the port registered for its destination
    struct Forward;

    #[async_trait]
    impl MessageHandler for Forward {
        fn name(&self) -> &str {
            "forward"
        }

        async fn handle(&self, tunnel: &Tunnel, msg: &Message) -> HandlerResult {
            match tunnel.get_port(&msg.dst) {
                Some(port) => {
                    port.deliver(msg.clone()).await?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn test_message_reaches_destination_port() {
        let tunnel = tunnel();
        tunnel.add_message_handler(Forward);
        let a = tunnel.add_port("10.0.0.1", false);
        let b = tunnel.add_port("10.0.0.2", false);
        let mut b_rx = b.take_outbound().unwrap();
        let done = tunnel.start().unwrap();

        a.send(msg("10.0.0.2")).await.unwrap();
        let got = timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.src, "10.0.0.1");
        assert_eq!(got.dst, "10.0.0.2");

        tunnel.close();
        let err = timeout(WAIT, done).await.unwrap().unwrap();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_newest_handler_runs_first_and_short_circuits() {
        let tunnel = tunnel();
        let older = Arc::new(AtomicUsize::new(0));
        let newer = Arc::new(AtomicUsize::new(0));

        let seen = older.clone();
        tunnel.add_message_handler(handler_fn("older", move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }));
        let seen = newer.clone();
        tunnel.add_message_handler(handler_fn("newer", move |_, m| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(m.dst == "claimed")
        }));

        let port = tunnel.add_port("10.0.0.1", false);
        let done = tunnel.start().unwrap();

        port.send(msg("claimed")).await.unwrap();
        port.send(msg("passed")).await.unwrap();
        // Pushes the previous message through the single-slot queue
        port.send(msg("claimed")).await.unwrap();
        tunnel.close();
        timeout(WAIT, done).await.unwrap().unwrap();

        assert!(newer.load(Ordering::SeqCst) >= 2);
        assert_eq!(older.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_stops_tunnel_and_closes_ports() {
        let tunnel = tunnel();
        tunnel.add_message_handler(handler_fn("broken", |_, _| Err("boom".into())));
        let a = tunnel.add_port("10.0.0.1", false);
        let b = tunnel.add_port("10.0.0.2", true);
        let done = tunnel.start().unwrap();

        a.send(msg("10.0.0.2")).await.unwrap();
        let err = timeout(WAIT, done).await.unwrap().unwrap();

        assert!(matches!(err, TunnelError::Handler(ref e) if e.to_string() == "boom"));
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(tunnel.port_count(), 0);
        assert!(tunnel.get_fallback_port().is_none());
        assert_eq!(tunnel.state(), TunnelState::Terminated);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let tunnel = tunnel();
        let done = tunnel.start().unwrap();
        assert!(matches!(tunnel.start(), Err(TunnelError::AlreadyStarted)));

        tunnel.close();
        timeout(WAIT, done).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_is_safe_in_every_state() {
        let tunnel = tunnel();
        tunnel.close();
        tunnel.close();
        assert_eq!(tunnel.state(), TunnelState::Idle);

        let done = tunnel.start().unwrap();
        assert_eq!(tunnel.state(), TunnelState::Running);
        tunnel.close();
        tunnel.close();
        let err = timeout(WAIT, done).await.unwrap().unwrap();
        assert!(err.is_closed());

        tunnel.close();
        tunnel.close();
        assert_eq!(tunnel.state(), TunnelState::Terminated);
    }

    #[tokio::test]
    async fn test_replacing_port_closes_previous() {
        let tunnel = tunnel();
        let first = tunnel.add_port("10.0.0.5", true);
        let second = tunnel.add_port("10.0.0.5", false);

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(tunnel.port_count(), 1);
        assert!(Arc::ptr_eq(&tunnel.get_port("10.0.0.5").unwrap(), &second));
        // The replaced fallback no longer receives unclaimed traffic
        assert!(tunnel.get_fallback_port().is_none());
    }

    #[tokio::test]
    async fn test_latest_fallback_wins() {
        let tunnel = tunnel();
        tunnel.add_port("tun0", true);
        let latest = tunnel.add_port("tun1", true);

        let fallback = tunnel.get_fallback_port().unwrap();
        assert!(Arc::ptr_eq(&fallback, &latest));
        assert!(fallback.is_fallback());
    }

    #[tokio::test]
    async fn test_retire_port() {
        let tunnel = tunnel();
        let port = tunnel.add_port("tun0", true);

        let retired = tunnel.retire_port("tun0").unwrap();
        assert!(Arc::ptr_eq(&retired, &port));
        assert!(port.is_closed());
        assert!(tunnel.get_fallback_port().is_none());
        assert!(tunnel.ports().is_empty());

        assert!(matches!(
            tunnel.remove_port("tun0"),
            Err(TunnelError::PortNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unclaimed_message_is_dropped() {
        let tunnel = tunnel();
        let port = tunnel.add_port("10.0.0.1", false);
        let done = tunnel.start().unwrap();

        port.send(msg("nowhere")).await.unwrap();
        port.send(msg("nowhere")).await.unwrap();
        tunnel.close();

        let err = timeout(WAIT, done).await.unwrap().unwrap();
        assert!(err.is_closed());
        assert!(tunnel.dispatched() >= 1);
    }

    #[tokio::test]
    async fn test_port_added_after_termination_is_closed() {
        let tunnel = tunnel();
        let done = tunnel.start().unwrap();
        tunnel.close();
        timeout(WAIT, done).await.unwrap().unwrap();

        let late = tunnel.add_port("late", true);
        assert!(late.is_closed());
        assert_eq!(tunnel.port_count(), 0);
        assert!(tunnel.get_fallback_port().is_none());
        assert_eq!(tunnel.state(), TunnelState::Terminated);
        assert!(matches!(
            late.send(msg("10.0.0.1")).await,
            Err(TunnelError::PortClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_reported() {
        let tunnel = tunnel();
        tunnel.add_message_handler(handler_fn("panics", |_, _| panic!("handler exploded")));
        let a = tunnel.add_port("10.0.0.1", false);
        let b = tunnel.add_port("10.0.0.2", true);
        let mut b_rx = b.take_outbound().unwrap();
        let done = tunnel.start().unwrap();

        a.send(msg("10.0.0.2")).await.unwrap();
        let err = timeout(WAIT, done).await.unwrap().unwrap();

        assert!(matches!(err, TunnelError::LoopPanicked(_)));
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(timeout(WAIT, b_rx.recv()).await.unwrap(), None);
        assert_eq!(tunnel.port_count(), 0);
        assert!(tunnel.get_fallback_port().is_none());
        assert_eq!(tunnel.state(), TunnelState::Terminated);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TunnelState::Idle.to_string(), "idle");
        assert_eq!(TunnelState::Terminated.to_string(), "terminated");
    }
}
