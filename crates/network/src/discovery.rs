//! Peer discovery
//!
//! A [`PeerSource`] yields peer IDs as they are found; a [`DiscoveryTask`]
//! dials each one through a [`Dialer`] and reports successful connections.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Result;

/// Lazy, unbounded feed of discovered peers
pub trait PeerSource: Send + Sync {
    fn discover(&self, namespace: &str) -> BoxStream<'static, PeerId>;
}

/// Opens a connection to a peer
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: PeerId) -> Result<()>;
}

/// Background task dialing every peer a source discovers
pub struct DiscoveryTask {
    namespace: String,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
    dialed: Arc<AtomicUsize>,
    connected: Option<mpsc::UnboundedReceiver<PeerId>>,
}

impl DiscoveryTask {
    /// Start discovering peers in `namespace`. Must be called inside a tokio
    /// runtime.
    pub fn spawn(namespace: &str, source: &dyn PeerSource, dialer: Arc<dyn Dialer>) -> Self {
        let peers = source.discover(namespace);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (connected_tx, connected_rx) = mpsc::unbounded_channel();
        let dialed = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn(run(
            namespace.to_string(),
            peers,
            dialer,
            shutdown_rx,
            connected_tx,
            dialed.clone(),
        ));
        info!("Peer discovery started for namespace '{}'", namespace);

        Self {
            namespace: namespace.to_string(),
            shutdown_tx,
            handle,
            dialed,
            connected: Some(connected_rx),
        }
    }

    /// Take the feed of successfully dialed peers. Only the first call gets it.
    pub fn take_connected(&mut self) -> Option<mpsc::UnboundedReceiver<PeerId>> {
        self.connected.take()
    }

    /// Number of successful dials so far
    pub fn dialed(&self) -> usize {
        self.dialed.load(Ordering::Relaxed)
    }

    /// Cancel the task and wait for it to finish
    pub async fn stop(self) {
        let _ = self.shutdown_tx.try_send(());
        if let Err(e) = self.handle.await {
            warn!("Discovery task for '{}' failed: {}", self.namespace, e);
        }
    }
}

async fn run(
    namespace: String,
    mut peers: BoxStream<'static, PeerId>,
    dialer: Arc<dyn Dialer>,
    mut shutdown_rx: mpsc::Receiver<()>,
    connected: mpsc::UnboundedSender<PeerId>,
    dialed: Arc<AtomicUsize>,
) {
    let mut seen = HashSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Peer discovery for '{}' stopped", namespace);
                break;
            }
            next = peers.next() => {
                let Some(peer) = next else {
                    info!("Peer source for '{}' ended", namespace);
                    break;
                };
                if !seen.insert(peer) {
                    continue;
                }

                debug!("Dialing discovered peer {}", peer);
                let outcome = tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Peer discovery for '{}' stopped while dialing {}", namespace, peer);
                        break;
                    }
                    outcome = dialer.dial(peer) => outcome,
                };
                match outcome {
                    Ok(()) => {
                        dialed.fetch_add(1, Ordering::Relaxed);
                        info!("Connected to peer {}", peer);
                        let _ = connected.send(peer);
                    }
                    Err(e) => {
                        warn!("Failed to dial {}: {}", peer, e);
                        // Allow a later rediscovery to retry
                        seen.remove(&peer);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetworkError;
    use futures::{future, stream};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct FixedPeers(Vec<PeerId>);

    impl PeerSource for FixedPeers {
        fn discover(&self, _namespace: &str) -> BoxStream<'static, PeerId> {
            stream::iter(self.0.clone()).boxed()
        }
    }

    /// Never yields; discovery only ends on stop
    struct SilentSource;

    impl PeerSource for SilentSource {
        fn discover(&self, _namespace: &str) -> BoxStream<'static, PeerId> {
            stream::pending().boxed()
        }
    }

    #[derive(Default)]
    struct RecordingDialer {
        attempts: Mutex<Vec<PeerId>>,
        reject: Option<PeerId>,
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn dial(&self, peer: PeerId) -> Result<()> {
            self.attempts.lock().push(peer);
            if self.reject == Some(peer) {
                return Err(NetworkError::Dial {
                    peer,
                    reason: "connection refused".to_string(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dials_each_peer_once() {
        let a = PeerId::random();
        let b = PeerId::random();
        let source = FixedPeers(vec![a, b, a]);
        let dialer = Arc::new(RecordingDialer::default());

        let mut task = DiscoveryTask::spawn("test", &source, dialer.clone());
        let mut connected = task.take_connected().unwrap();
        assert!(task.take_connected().is_none());

        assert_eq!(timeout(WAIT, connected.recv()).await.unwrap(), Some(a));
        assert_eq!(timeout(WAIT, connected.recv()).await.unwrap(), Some(b));
        // Source is exhausted, so the task ends and the feed closes
        assert_eq!(timeout(WAIT, connected.recv()).await.unwrap(), None);

        assert_eq!(task.dialed(), 2);
        assert_eq!(*dialer.attempts.lock(), vec![a, b]);
        task.stop().await;
    }

    #[tokio::test]
    async fn test_dial_failure_keeps_going() {
        let bad = PeerId::random();
        let good = PeerId::random();
        let source = FixedPeers(vec![bad, good, bad]);
        let dialer = Arc::new(RecordingDialer {
            reject: Some(bad),
            ..Default::default()
        });

        let mut task = DiscoveryTask::spawn("test", &source, dialer.clone());
        let mut connected = task.take_connected().unwrap();

        assert_eq!(timeout(WAIT, connected.recv()).await.unwrap(), Some(good));
        assert_eq!(timeout(WAIT, connected.recv()).await.unwrap(), None);

        // The failed peer was retried when it showed up again
        assert_eq!(*dialer.attempts.lock(), vec![bad, good, bad]);
        assert_eq!(task.dialed(), 1);
        task.stop().await;
    }

    /// Dials that never complete
    #[derive(Default)]
    struct StalledDialer {
        started: Notify,
    }

    #[async_trait]
    impl Dialer for StalledDialer {
        async fn dial(&self, _peer: PeerId) -> Result<()> {
            self.started.notify_one();
            future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stop_cancels_dial_in_flight() {
        let source = FixedPeers(vec![PeerId::random()]);
        let dialer = Arc::new(StalledDialer::default());

        let mut task = DiscoveryTask::spawn("test", &source, dialer.clone());
        let mut connected = task.take_connected().unwrap();
        timeout(WAIT, dialer.started.notified()).await.unwrap();

        timeout(WAIT, task.stop()).await.unwrap();
        assert_eq!(connected.recv().await, None);
    }

    #[tokio::test]
    async fn test_stop_cancels_idle_task() {
        let dialer = Arc::new(RecordingDialer::default());
        let task = DiscoveryTask::spawn("test", &SilentSource, dialer);

        timeout(WAIT, task.stop()).await.unwrap();
    }
}
