//! pulsegrid-transport: heartbeat transports of the PulseGrid agent.
//!
//! Every `[[hb]]` entry of the cluster configuration becomes one
//! [`Transport`] running a tx loop (`<name>.tx`) and an rx loop
//! (`<name>.rx`). The loops only move payloads; liveness decisions are
//! left to the control core, which they feed through a `CtrlHandle`.
//!
//! ```text
//!            ┌── unicast   (TCP, one JSON line per connection)
//! Transport ─┼── multicast (UDP datagram to a group)
//!            ├── disk      (4 KiB slot per node in a shared file)
//!            └── relay     (HTTP PUT/GET through a relay server)
//! ```

pub mod disk;
pub mod driver;
pub mod error;
pub mod message;
pub mod multicast;
pub mod relay;
pub mod unicast;

use pulse_core::{HbConfig, HbDriverConfig, HbKind};
use pulsegrid_hb::HeartbeatId;
use tokio_util::sync::CancellationToken;

pub use disk::Disk;
pub use driver::{HbContext, HbSettings};
pub use error::{TransportError, TransportResult};
pub use message::HbMessage;
pub use multicast::Multicast;
pub use relay::Relay;
pub use unicast::Unicast;

/// One configured heartbeat transport.
pub enum Transport {
    Unicast(Unicast),
    Multicast(Multicast),
    Disk(Disk),
    Relay(Relay),
}

impl Transport {
    pub fn from_config(hb: &HbConfig) -> TransportResult<Self> {
        let settings = HbSettings::from_config(hb)?;
        Ok(match &hb.driver {
            HbDriverConfig::Unicast { port, addrs } => {
                Transport::Unicast(Unicast::new(settings, *port, addrs.clone()))
            }
            HbDriverConfig::Multicast { addr, port, intf } => {
                Transport::Multicast(Multicast::new(settings, addr, *port, intf.as_deref())?)
            }
            HbDriverConfig::Disk { dev } => Transport::Disk(Disk::new(settings, dev.clone())),
            HbDriverConfig::Relay { relay } => Transport::Relay(Relay::new(settings, relay)),
        })
    }

    fn settings(&self) -> &HbSettings {
        match self {
            Transport::Unicast(t) => t.settings(),
            Transport::Multicast(t) => t.settings(),
            Transport::Disk(t) => t.settings(),
            Transport::Relay(t) => t.settings(),
        }
    }

    /// Transport name, e.g. `hb#1`.
    pub fn id(&self) -> &str {
        &self.settings().name
    }

    pub fn kind(&self) -> HbKind {
        self.settings().kind
    }

    pub fn tx_id(&self) -> HeartbeatId {
        self.settings().tx_id()
    }

    pub fn rx_id(&self) -> HeartbeatId {
        self.settings().rx_id()
    }

    /// Register with the control core and spawn both loops under a child
    /// of `parent`.
    pub async fn start(&mut self, ctx: &HbContext, parent: &CancellationToken) -> TransportResult<()> {
        match self {
            Transport::Unicast(t) => t.start(ctx, parent).await,
            Transport::Multicast(t) => t.start(ctx, parent).await,
            Transport::Disk(t) => t.start(ctx, parent).await,
            Transport::Relay(t) => t.start(ctx, parent).await,
        }
    }

    /// Stop both loops and unregister. A stopped transport can be started again.
    pub async fn stop(&mut self) {
        match self {
            Transport::Unicast(t) => t.stop().await,
            Transport::Multicast(t) => t.stop().await,
            Transport::Disk(t) => t.stop().await,
            Transport::Relay(t) => t.stop().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::ClusterConfig;

    const CONFIG: &str = r#"
[cluster]
name = "c1"
nodes = ["n1", "n2"]

[node]
name = "n1"

[[hb]]
name = "hb#1"
type = "unicast"
port = 7001

[[hb]]
name = "hb#2"
type = "multicast"
addr = "239.0.0.1"
port = 7002
interval = "1s"

[[hb]]
name = "hb#3"
type = "disk"
dev = "/dev/shm/pulse.slots"

[[hb]]
name = "hb#4"
type = "relay"
relay = "relay.local:8080"
timeout = "30s"
"#;

    #[test]
    fn builds_one_transport_per_hb() {
        let config: ClusterConfig = CONFIG.parse().unwrap();
        let transports: Vec<Transport> = config
            .hb
            .iter()
            .map(|hb| Transport::from_config(hb).unwrap())
            .collect();

        let kinds: Vec<HbKind> = transports.iter().map(Transport::kind).collect();
        assert_eq!(
            kinds,
            vec![HbKind::Unicast, HbKind::Multicast, HbKind::Disk, HbKind::Relay]
        );
        assert_eq!(transports[0].id(), "hb#1");
        assert_eq!(transports[1].tx_id().as_str(), "hb#2.tx");
        assert_eq!(transports[3].rx_id().as_str(), "hb#4.rx");
        assert_eq!(transports[1].settings().timeout, std::time::Duration::from_secs(7));
        assert_eq!(transports[3].settings().timeout, std::time::Duration::from_secs(30));
    }

    #[test]
    fn bad_multicast_group_fails() {
        let config: ClusterConfig = CONFIG.replace("239.0.0.1", "nowhere").parse().unwrap();
        assert!(matches!(
            Transport::from_config(&config.hb[1]),
            Err(TransportError::Addr(_))
        ));
    }
}
