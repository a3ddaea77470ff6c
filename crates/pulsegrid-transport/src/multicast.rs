//! Multicast heartbeat over UDP: one datagram per beat to the group.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{BeatSender, HbContext, HbSettings, Running, RxPeers, tx_loop};
use crate::error::{TransportError, TransportResult};
use crate::message::{HbMessage, MAX_PAYLOAD};

pub struct Multicast {
    settings: HbSettings,
    group: Ipv4Addr,
    port: u16,
    intf: Ipv4Addr,
    local_addr: Option<SocketAddr>,
    running: Option<Running>,
}

impl Multicast {
    pub fn new(
        settings: HbSettings,
        addr: &str,
        port: u16,
        intf: Option<&str>,
    ) -> TransportResult<Self> {
        let group = addr
            .parse()
            .map_err(|_| TransportError::Addr(addr.to_string()))?;
        let intf = match intf {
            Some(i) => i.parse().map_err(|_| TransportError::Addr(i.to_string()))?,
            None => Ipv4Addr::UNSPECIFIED,
        };
        Ok(Self {
            settings,
            group,
            port,
            intf,
            local_addr: None,
            running: None,
        })
    }

    pub fn settings(&self) -> &HbSettings {
        &self.settings
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self, ctx: &HbContext, parent: &CancellationToken) -> TransportResult<()> {
        if self.running.is_some() {
            return Err(TransportError::AlreadyRunning(self.settings.name.clone()));
        }
        let rx_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        if self.group.is_multicast() {
            rx_socket.join_multicast_v4(self.group, self.intf)?;
            info!(group = %self.group, port = self.port, intf = %self.intf, "joined multicast group");
        }
        let local_port = rx_socket.local_addr()?.port();
        self.local_addr = Some(SocketAddr::from((Ipv4Addr::LOCALHOST, local_port)));

        let tx_socket = UdpSocket::bind((self.intf, 0)).await?;
        tx_socket.set_multicast_loop_v4(true)?;
        let sender = MulticastSender {
            socket: tx_socket,
            dest: SocketAddr::from((self.group, self.port)),
            peers: ctx.peers(),
        };

        let mut running = Running::begin(&self.settings, ctx, parent).await;
        running.spawn(tx_loop(
            sender,
            ctx.clone(),
            self.settings.tx_id(),
            self.settings.interval,
            running.token(),
        ));
        running.spawn(rx_loop(
            rx_socket,
            RxPeers::new(ctx.clone(), self.settings.rx_id()),
            running.token(),
        ));
        self.running = Some(running);
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop(&self.settings).await;
        }
        self.local_addr = None;
    }
}

struct MulticastSender {
    socket: UdpSocket,
    dest: SocketAddr,
    peers: Vec<String>,
}

impl BeatSender for MulticastSender {
    /// A datagram that left the host counts for every peer.
    async fn send(&mut self, msg: &HbMessage) -> Vec<(String, bool)> {
        let ok = match msg.encode() {
            Ok(payload) => match self.socket.send_to(&payload, self.dest).await {
                Ok(_) => true,
                Err(e) => {
                    debug!(dest = %self.dest, error = %e, "multicast send failed");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "encode heartbeat failed");
                false
            }
        };
        self.peers.iter().map(|p| (p.clone(), ok)).collect()
    }
}

async fn rx_loop(socket: UdpSocket, mut peers: RxPeers, token: CancellationToken) {
    let mut buf = vec![0u8; MAX_PAYLOAD];
    loop {
        let (len, from) = tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "multicast receive failed");
                    continue;
                }
            },
        };
        match HbMessage::decode(&buf[..len]) {
            Ok(msg) => peers.received(msg).await,
            Err(e) => debug!(%from, error = %e, "bad multicast payload"),
        }
    }
    debug!("multicast rx loop stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulse_core::{HbKind, MonitorState};

    use super::*;
    use crate::driver::testing::{context, eventually};

    fn settings() -> HbSettings {
        HbSettings {
            name: "hb#2".to_string(),
            kind: HbKind::Multicast,
            interval: Duration::from_millis(50),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn bad_addresses_are_rejected() {
        assert!(matches!(
            Multicast::new(settings(), "not-an-ip", 7000, None),
            Err(TransportError::Addr(_))
        ));
        assert!(matches!(
            Multicast::new(settings(), "239.0.0.1", 7000, Some("eth0")),
            Err(TransportError::Addr(_))
        ));
    }

    /// A non-group address skips the join, which keeps the test off the
    /// host's multicast routing.
    #[tokio::test]
    async fn rx_reports_datagrams_from_peers() {
        let token = CancellationToken::new();
        let ctx = context(&token);
        let mut hb = Multicast::new(settings(), "127.0.0.1", 0, None).unwrap();
        hb.start(&ctx, &token).await.unwrap();
        let target = hb.local_addr().unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rx_id = hb.settings().rx_id();
        let beating = eventually(|| {
            let (ctrl, id, socket) = (ctx.ctrl.clone(), rx_id.clone(), &socket);
            async move {
                let payload = HbMessage::new("c1", "n3", MonitorState::Upgrade)
                    .encode()
                    .unwrap();
                socket.send_to(&payload, target).await.unwrap();
                ctrl.peer_status(&id).await.get("n3").is_some_and(|p| p.beating)
            }
        })
        .await;
        assert!(beating);

        hb.stop().await;
        token.cancel();
    }
}
