//! Destination routing
//!
//! [`SwitchHandler`] forwards each message to the port registered for its
//! destination, or to the fallback port. Destinations inside the fake
//! address range are first rewritten to the real address they stand for.

use std::sync::Arc;

use async_trait::async_trait;
use meshtun_core::{Message, TunnelConfig};
use meshtun_fakeip::FakeIpManager;
use tracing::{debug, trace};

use crate::{HandlerResult, MessageHandler, Tunnel, TunnelError};

pub struct SwitchHandler {
    fakeip: Option<Arc<FakeIpManager>>,
}

impl SwitchHandler {
    pub fn new(fakeip: Option<Arc<FakeIpManager>>) -> Self {
        Self { fakeip }
    }

    /// Real-address copy of `msg` if it targets a mapped fake address
    fn translate(&self, msg: &Message) -> Option<Message> {
        let fakeip = self.fakeip.as_ref()?;
        let dst = msg.dst_ip()?;
        if !fakeip.is_fake(dst) {
            return None;
        }
        match fakeip.resolve_real(dst) {
            Some(real) => {
                trace!("Rewriting fake destination {} to {}", dst, real);
                Some(msg.redirect(real.to_string()))
            }
            None => {
                debug!("No mapping for fake destination {}", dst);
                None
            }
        }
    }
}

#[async_trait]
impl MessageHandler for SwitchHandler {
    fn name(&self) -> &str {
        "switch"
    }

    async fn handle(&self, tunnel: &Tunnel, msg: &Message) -> HandlerResult {
        let routed = self.translate(msg).unwrap_or_else(|| msg.clone());

        let Some(port) = tunnel
            .get_port(&routed.dst)
            .or_else(|| tunnel.get_fallback_port())
        else {
            return Ok(false);
        };

        if port.address() == routed.src {
            debug!("Not reflecting message from {} back to its source", routed.src);
            return Ok(false);
        }

        match port.deliver(routed).await {
            Ok(()) => Ok(true),
            // Lost a race with retire_port; the message has nowhere to go
            Err(TunnelError::PortClosed(addr)) => {
                debug!("Dropping message for closed port {}", addr);
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Tunnel {
    /// Tunnel with a [`SwitchHandler`] installed
    pub fn switch(config: TunnelConfig, fakeip: Option<Arc<FakeIpManager>>) -> Self {
        let tunnel = Self::new(config);
        tunnel.add_message_handler(SwitchHandler::new(fakeip));
        tunnel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn msg(dst: impl Into<String>) -> Message {
        Message::new(dst, Bytes::from_static(b"data"))
    }

    #[tokio::test]
    async fn test_routes_to_destination_port() {
        let tunnel = Tunnel::switch(TunnelConfig::default(), None);
        let tun = tunnel.add_port("192.168.100.2", true);
        let peer = tunnel.add_port("10.0.0.7", false);
        let mut peer_rx = peer.take_outbound().unwrap();
        let done = tunnel.start().unwrap();

        tun.send(msg("10.0.0.7")).await.unwrap();
        let got = timeout(WAIT, peer_rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.src, "192.168.100.2");

        tunnel.close();
        assert!(timeout(WAIT, done).await.unwrap().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_unknown_destination_goes_to_fallback() {
        let tunnel = Tunnel::switch(TunnelConfig::default(), None);
        let tun = tunnel.add_port("192.168.100.2", true);
        let peer = tunnel.add_port("10.0.0.7", false);
        let mut tun_rx = tun.take_outbound().unwrap();
        let done = tunnel.start().unwrap();

        peer.send(msg("172.16.0.1")).await.unwrap();
        let got = timeout(WAIT, tun_rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.src, "10.0.0.7");
        assert_eq!(got.dst, "172.16.0.1");

        tunnel.close();
        timeout(WAIT, done).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fake_destination_is_rewritten() {
        let fakeip = Arc::new(FakeIpManager::from_range("198.18.0.0/24").unwrap());
        let real = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        let fake = fakeip.allocate("peer.example", real).unwrap();

        let tunnel = Tunnel::switch(TunnelConfig::default(), Some(fakeip));
        let tun = tunnel.add_port("192.168.100.2", true);
        let peer = tunnel.add_port("10.0.0.7", false);
        let mut peer_rx = peer.take_outbound().unwrap();
        let done = tunnel.start().unwrap();

        tun.send(msg(fake.to_string())).await.unwrap();
        let got = timeout(WAIT, peer_rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.dst, "10.0.0.7");
        assert_eq!(got.payload, Bytes::from_static(b"data"));

        tunnel.close();
        timeout(WAIT, done).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_route_leaves_message_unclaimed() {
        let tunnel = Tunnel::switch(TunnelConfig::default(), None);
        let handler = SwitchHandler::new(None);

        let claimed = handler
            .handle(&tunnel, &msg("10.9.9.9").with_src("10.0.0.1"))
            .await
            .unwrap();
        assert!(!claimed);
    }

    #[tokio::test]
    async fn test_fallback_traffic_is_not_reflected() {
        let tunnel = Tunnel::new(TunnelConfig::default());
        tunnel.add_port("192.168.100.2", true);
        let handler = SwitchHandler::new(None);

        let claimed = handler
            .handle(&tunnel, &msg("172.16.0.1").with_src("192.168.100.2"))
            .await
            .unwrap();
        assert!(!claimed);
    }

    #[tokio::test]
    async fn test_closed_port_counts_as_handled() {
        let tunnel = Tunnel::new(TunnelConfig::default());
        let peer = tunnel.add_port("10.0.0.7", false);
        peer.close();
        let handler = SwitchHandler::new(None);

        let claimed = handler
            .handle(&tunnel, &msg("10.0.0.7").with_src("10.0.0.1"))
            .await
            .unwrap();
        assert!(claimed);
    }
}
