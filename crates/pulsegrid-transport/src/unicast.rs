//! Unicast heartbeat over TCP: one newline-terminated JSON payload per
//! connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::driver::{BeatSender, HbContext, HbSettings, Running, RxPeers, tx_loop};
use crate::error::{TransportError, TransportResult};
use crate::message::{HbMessage, MAX_PAYLOAD};

const IO_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Unicast {
    settings: HbSettings,
    port: u16,
    addrs: HashMap<String, String>,
    local_addr: Option<SocketAddr>,
    running: Option<Running>,
}

impl Unicast {
    pub fn new(settings: HbSettings, port: u16, addrs: HashMap<String, String>) -> Self {
        Self {
            settings,
            port,
            addrs,
            local_addr: None,
            running: None,
        }
    }

    pub fn settings(&self) -> &HbSettings {
        &self.settings
    }

    /// Address the rx listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self, ctx: &HbContext, parent: &CancellationToken) -> TransportResult<()> {
        if self.running.is_some() {
            return Err(TransportError::AlreadyRunning(self.settings.name.clone()));
        }
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        self.local_addr = Some(listener.local_addr()?);

        let mut running = Running::begin(&self.settings, ctx, parent).await;
        let sender = UnicastSender {
            targets: ctx
                .peers()
                .into_iter()
                .map(|peer| {
                    let target = target_addr(&peer, self.addrs.get(&peer), self.port);
                    (peer, target)
                })
                .collect(),
        };
        running.spawn(tx_loop(
            sender,
            ctx.clone(),
            self.settings.tx_id(),
            self.settings.interval,
            running.token(),
        ));
        running.spawn(rx_loop(
            listener,
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

/// `host` alone is dialed on the heartbeat port; `host:port` as is.
fn target_addr(peer: &str, addr: Option<&String>, port: u16) -> String {
    match addr {
        Some(a) if a.contains(':') => a.clone(),
        Some(a) => format!("{a}:{port}"),
        None => format!("{peer}:{port}"),
    }
}

struct UnicastSender {
    targets: Vec<(String, String)>,
}

impl BeatSender for UnicastSender {
    async fn send(&mut self, msg: &HbMessage) -> Vec<(String, bool)> {
        let payload = match msg.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "encode heartbeat failed");
                return Vec::new();
            }
        };
        let mut results = Vec::with_capacity(self.targets.len());
        for (peer, target) in &self.targets {
            let ok = match send_one(target, &payload).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(%peer, %target, error = %e, "unicast send failed");
                    false
                }
            };
            results.push((peer.clone(), ok));
        }
        results
    }
}

async fn send_one(target: &str, payload: &[u8]) -> TransportResult<()> {
    let io = async {
        let mut stream = TcpStream::connect(target).await?;
        stream.write_all(payload).await?;
        stream.write_all(b"\n").await?;
        stream.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };
    tokio::time::timeout(IO_TIMEOUT, io)
        .await
        .map_err(|_| TransportError::Timeout(IO_TIMEOUT))??;
    Ok(())
}

async fn rx_loop(listener: TcpListener, mut peers: RxPeers, token: CancellationToken) {
    loop {
        let (stream, from) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "unicast accept failed");
                    continue;
                }
            },
        };
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = read_one(stream) => read,
        };
        match read {
            Ok(msg) => peers.received(msg).await,
            Err(e) => debug!(%from, error = %e, "bad unicast payload"),
        }
    }
    debug!("unicast rx loop stopped");
}

async fn read_one(stream: TcpStream) -> TransportResult<HbMessage> {
    let mut line = Vec::new();
    let mut reader = BufReader::new(stream.take(MAX_PAYLOAD as u64 + 1));
    tokio::time::timeout(IO_TIMEOUT, reader.read_until(b'\n', &mut line))
        .await
        .map_err(|_| TransportError::Timeout(IO_TIMEOUT))??;
    HbMessage::decode(&line)
}

#[cfg(test)]
mod tests {
    use pulse_core::MonitorState;

    use super::*;
    use crate::driver::testing::{context, eventually};

    fn settings() -> HbSettings {
        HbSettings {
            name: "hb#1".to_string(),
            kind: pulse_core::HbKind::Unicast,
            interval: Duration::from_millis(50),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn targets_resolve_per_peer() {
        let host = "10.0.0.2".to_string();
        let full = "127.0.0.1:9000".to_string();
        assert_eq!(target_addr("n2", Some(&host), 7000), "10.0.0.2:7000");
        assert_eq!(target_addr("n2", Some(&full), 7000), "127.0.0.1:9000");
        assert_eq!(target_addr("n3", None, 7000), "n3:7000");
    }

    #[tokio::test]
    async fn rx_reports_peer_payloads() {
        let token = CancellationToken::new();
        let ctx = context(&token);
        let mut hb = Unicast::new(settings(), 0, HashMap::new());
        hb.start(&ctx, &token).await.unwrap();
        let addr = hb.local_addr().unwrap();
        let target = format!("127.0.0.1:{}", addr.port());

        let payload = HbMessage::new("c1", "n2", MonitorState::Idle).encode().unwrap();
        send_one(&target, &payload).await.unwrap();

        let rx_id = hb.settings().rx_id();
        assert!(
            eventually(|| {
                let (ctrl, id) = (ctx.ctrl.clone(), rx_id.clone());
                async move { ctrl.peer_status(&id).await.get("n2").is_some_and(|p| p.beating) }
            })
            .await
        );

        hb.stop().await;
        assert!(ctx.ctrl.peer_status(&rx_id).await.is_empty());
        assert!(hb.local_addr().is_none());
        token.cancel();
    }

    #[tokio::test]
    async fn tx_dials_every_peer() {
        let token = CancellationToken::new();
        let ctx = context(&token);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = listener.local_addr().unwrap().to_string();
        let addrs = HashMap::from([
            ("n2".to_string(), peer_addr.clone()),
            ("n3".to_string(), peer_addr),
        ]);
        let mut hb = Unicast::new(settings(), 0, addrs);
        hb.start(&ctx, &token).await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let msg = read_one(stream).await.unwrap();
        assert_eq!(msg.cluster, "c1");
        assert_eq!(msg.node, "n1");

        let tx_id = hb.settings().tx_id();
        assert!(
            eventually(|| {
                let (ctrl, id) = (ctx.ctrl.clone(), tx_id.clone());
                async move { ctrl.peer_status(&id).await.get("n2").is_some_and(|p| p.beating) }
            })
            .await
        );
        hb.stop().await;
        token.cancel();
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let token = CancellationToken::new();
        let ctx = context(&token);
        let mut hb = Unicast::new(settings(), 0, HashMap::new());
        hb.start(&ctx, &token).await.unwrap();
        assert!(matches!(
            hb.start(&ctx, &token).await,
            Err(TransportError::AlreadyRunning(_))
        ));
        hb.stop().await;
        token.cancel();
    }
}
