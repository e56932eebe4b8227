//! Addressable tunnel endpoints
//!
//! A port has two directions. Inbound, its transport pushes messages into
//! the tunnel's shared queue with [`Port::send`]. Outbound, handlers push
//! messages to the port with [`Port::deliver`] and the transport drains
//! them through the [`PortReceiver`] it took with [`Port::take_outbound`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use meshtun_core::{Message, PortAddr};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Result, TunnelError};

/// One endpoint of the tunnel
pub struct Port {
    addr: PortAddr,
    fallback: bool,
    inbound: mpsc::Sender<Message>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    receiver: Mutex<Option<PortReceiver>>,
    closed: AtomicBool,
}

impl Port {
    pub(crate) fn new(
        addr: PortAddr,
        fallback: bool,
        inbound: mpsc::Sender<Message>,
        buffer: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Arc::new(Self {
            receiver: Mutex::new(Some(PortReceiver {
                addr: addr.clone(),
                rx,
            })),
            addr,
            fallback,
            inbound,
            outbound: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        })
    }

    /// Address this port is registered under
    pub fn address(&self) -> &str {
        &self.addr
    }

    /// Whether this port receives messages nothing else claims
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Push a message into the tunnel, stamped with this port as source.
    ///
    /// Waits while the inbound queue is full. Fails with `PortClosed` once
    /// the port is closed and with `Closed` once the tunnel has stopped.
    pub async fn send(&self, msg: Message) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::PortClosed(self.addr.clone()));
        }
        self.inbound
            .send(msg.with_src(self.addr.clone()))
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// Hand a message to this port's transport.
    ///
    /// Waits while the outbound buffer is full. Fails with `PortClosed` once
    /// the port is closed or its receiver is gone.
    pub async fn deliver(&self, msg: Message) -> Result<()> {
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| TunnelError::PortClosed(self.addr.clone()))?;
        tx.send(msg)
            .await
            .map_err(|_| TunnelError::PortClosed(self.addr.clone()))
    }

    /// Take the outbound receiver. Only the first call gets it.
    pub fn take_outbound(&self) -> Option<PortReceiver> {
        self.receiver.lock().take()
    }

    /// Close the port. Returns false if it was already closed.
    ///
    /// The outbound receiver sees end-of-stream once buffered messages are
    /// drained.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.outbound.lock().take();
        // An untaken receiver has no reader; drop it so pending deliveries fail
        self.receiver.lock().take();
        debug!("Port {} closed", self.addr);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("addr", &self.addr)
            .field("fallback", &self.fallback)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Outbound side of a port, owned by its transport
#[derive(Debug)]
pub struct PortReceiver {
    addr: PortAddr,
    rx: mpsc::Receiver<Message>,
}

impl PortReceiver {
    /// Next outbound message, or `None` once the port is closed and drained
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Next buffered outbound message without waiting
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn address(&self) -> &str {
        &self.addr
    }
}
