//! Heartbeat ids: one direction of one named transport, e.g. `hb#2.rx`.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Receive side: reports remote liveness.
    Rx,
    /// Transmit side: reports local send success.
    Tx,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct HeartbeatId(String);

impl HeartbeatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn rx(name: &str) -> Self {
        Self(format!("{name}.rx"))
    }

    pub fn tx(name: &str) -> Self {
        Self(format!("{name}.tx"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Direction from the `.rx`/`.tx` suffix, `None` for anything else.
    pub fn direction(&self) -> Option<Direction> {
        if self.0.ends_with(".rx") {
            Some(Direction::Rx)
        } else if self.0.ends_with(".tx") {
            Some(Direction::Tx)
        } else {
            None
        }
    }

    pub fn is_rx(&self) -> bool {
        self.direction() == Some(Direction::Rx)
    }
}

impl fmt::Display for HeartbeatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HeartbeatId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for HeartbeatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_from_suffix() {
        assert_eq!(HeartbeatId::rx("hb#2").as_str(), "hb#2.rx");
        assert_eq!(HeartbeatId::rx("hb#2").direction(), Some(Direction::Rx));
        assert_eq!(HeartbeatId::tx("hb#2").direction(), Some(Direction::Tx));
        assert_eq!(HeartbeatId::from("hb#2").direction(), None);
        assert!(!HeartbeatId::from("hb#2.rxx").is_rx());
    }

    #[test]
    fn ordering_is_lexical() {
        let mut ids = vec![HeartbeatId::tx("hb#2"), HeartbeatId::rx("hb#1"), HeartbeatId::rx("hb#2")];
        ids.sort();
        let ids: Vec<&str> = ids.iter().map(HeartbeatId::as_str).collect();
        assert_eq!(ids, vec!["hb#1.rx", "hb#2.rx", "hb#2.tx"]);
    }
}
