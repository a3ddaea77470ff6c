//! HTTP relay heartbeat.
//!
//! Nodes without a direct path to each other meet at a relay: the tx loop
//! `PUT`s the local payload to `/relay/{cluster}/{node}` and the rx loop
//! `GET`s `/relay/{cluster}/{peer}` for every peer, treating an advanced
//! `sent_at_ms` as a beat. [`serve`] runs the relay itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::driver::{BeatSender, HbContext, HbSettings, Running, RxPeers, tx_loop};
use crate::error::{TransportError, TransportResult};
use crate::message::{HbMessage, MAX_PAYLOAD};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Relay {
    settings: HbSettings,
    relay: String,
    running: Option<Running>,
}

impl Relay {
    pub fn new(settings: HbSettings, relay: &str) -> Self {
        Self {
            settings,
            relay: relay.to_string(),
            running: None,
        }
    }

    pub fn settings(&self) -> &HbSettings {
        &self.settings
    }

    pub async fn start(&mut self, ctx: &HbContext, parent: &CancellationToken) -> TransportResult<()> {
        if self.running.is_some() {
            return Err(TransportError::AlreadyRunning(self.settings.name.clone()));
        }
        let mut running = Running::begin(&self.settings, ctx, parent).await;
        let sender = RelayPublisher {
            relay: self.relay.clone(),
            path: relay_path(&ctx.cluster, &ctx.node),
            peers: ctx.peers(),
        };
        running.spawn(tx_loop(
            sender,
            ctx.clone(),
            self.settings.tx_id(),
            self.settings.interval,
            running.token(),
        ));
        running.spawn(rx_loop(
            self.relay.clone(),
            ctx.cluster.clone(),
            self.settings.interval,
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
    }
}

fn relay_path(cluster: &str, node: &str) -> String {
    format!("/relay/{cluster}/{node}")
}

/// One HTTP/1.1 exchange with the relay on a fresh connection.
async fn request(
    relay: &str,
    method: Method,
    path: &str,
    body: Bytes,
) -> TransportResult<(StatusCode, Bytes)> {
    let exchange = async {
        let stream = TcpStream::connect(relay).await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("host", relay)
            .header("user-agent", "pulsegrid-relay/0.1")
            .body(Full::new(body))
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?
            .to_bytes();
        Ok::<_, TransportError>((status, body))
    };
    tokio::time::timeout(REQUEST_TIMEOUT, exchange)
        .await
        .map_err(|_| TransportError::Timeout(REQUEST_TIMEOUT))?
}

/// Fetch the payload a node last published to the relay.
pub async fn fetch(relay: &str, cluster: &str, node: &str) -> TransportResult<HbMessage> {
    let (status, body) = request(relay, Method::GET, &relay_path(cluster, node), Bytes::new()).await?;
    if !status.is_success() {
        return Err(TransportError::Http(format!("GET {node}: {status}")));
    }
    HbMessage::decode(&body)
}

pub async fn publish(relay: &str, msg: &HbMessage) -> TransportResult<()> {
    let path = relay_path(&msg.cluster, &msg.node);
    let (status, _) = request(relay, Method::PUT, &path, Bytes::from(msg.encode()?)).await?;
    if !status.is_success() {
        return Err(TransportError::Http(format!("PUT {path}: {status}")));
    }
    Ok(())
}

struct RelayPublisher {
    relay: String,
    path: String,
    peers: Vec<String>,
}

impl BeatSender for RelayPublisher {
    /// A payload accepted by the relay counts for every peer.
    async fn send(&mut self, msg: &HbMessage) -> Vec<(String, bool)> {
        let ok = match publish(&self.relay, msg).await {
            Ok(()) => true,
            Err(e) => {
                debug!(relay = %self.relay, path = %self.path, error = %e, "relay publish failed");
                false
            }
        };
        self.peers.iter().map(|p| (p.clone(), ok)).collect()
    }
}

async fn rx_loop(
    relay: String,
    cluster: String,
    interval: Duration,
    mut peers: RxPeers,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for peer in peers.peers() {
            let fetched = tokio::select! {
                _ = token.cancelled() => return,
                fetched = fetch(&relay, &cluster, &peer) => fetched,
            };
            match fetched {
                Ok(msg) => peers.polled(&peer, msg).await,
                Err(e) => {
                    debug!(%relay, %peer, error = %e, "relay fetch failed");
                    peers.failed(&peer).await;
                }
            }
        }
    }
    debug!(%relay, "relay rx loop stopped");
}

type Slots = Arc<RwLock<HashMap<String, Bytes>>>;

/// Run a relay on `listener` until `token` is cancelled.
///
/// The relay keeps the last payload `PUT` on each `/relay/{cluster}/{node}`
/// path in memory and hands it out on `GET`.
pub async fn serve(listener: TcpListener, token: CancellationToken) -> TransportResult<()> {
    let slots: Slots = Arc::new(RwLock::new(HashMap::new()));
    info!(addr = %listener.local_addr()?, "relay listening");

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "relay accept failed");
                    continue;
                }
            },
        };
        let slots = slots.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let slots = slots.clone();
                async move { Ok::<_, hyper::Error>(handle(req, slots, peer_addr).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                error!(%peer_addr, error = %e, "relay connection error");
            }
        });
    }

    info!("relay stopped");
    Ok(())
}

async fn handle(req: Request<Incoming>, slots: Slots, from: SocketAddr) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    if !is_relay_path(&path) {
        return reply(StatusCode::NOT_FOUND, Bytes::new());
    }
    let method = req.method().clone();
    match method {
        Method::GET => match slots.read().await.get(&path) {
            Some(payload) => reply(StatusCode::OK, payload.clone()),
            None => reply(StatusCode::NOT_FOUND, Bytes::new()),
        },
        Method::PUT => {
            let body = match req.into_body().collect().await {
                Ok(b) => b.to_bytes(),
                Err(e) => {
                    debug!(%from, error = %e, "relay body read failed");
                    return reply(StatusCode::BAD_REQUEST, Bytes::new());
                }
            };
            if body.len() > MAX_PAYLOAD {
                return reply(StatusCode::PAYLOAD_TOO_LARGE, Bytes::new());
            }
            debug!(%from, %path, len = body.len(), "relay payload stored");
            slots.write().await.insert(path, body);
            reply(StatusCode::NO_CONTENT, Bytes::new())
        }
        _ => reply(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()),
    }
}

fn is_relay_path(path: &str) -> bool {
    let mut parts = path.trim_start_matches('/').split('/');
    matches!(
        (parts.next(), parts.next(), parts.next(), parts.next()),
        (Some("relay"), Some(c), Some(n), None) if !c.is_empty() && !n.is_empty()
    )
}

fn reply(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    resp
}
