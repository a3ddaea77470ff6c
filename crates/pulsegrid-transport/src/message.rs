//! Heartbeat payload exchanged by every transport.

use std::time::{SystemTime, UNIX_EPOCH};

use pulse_core::MonitorState;
use serde::{Deserialize, Serialize};

use crate::error::{TransportError, TransportResult};

/// Largest encoded payload accepted on any transport; also the disk slot size.
pub const MAX_PAYLOAD: usize = 4096;

/// What a node tells its peers on every beat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HbMessage {
    pub cluster: String,
    pub node: String,
    #[serde(default)]
    pub monitor_state: MonitorState,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub sent_at_ms: u64,
}

impl HbMessage {
    pub fn new(cluster: &str, node: &str, monitor_state: MonitorState) -> Self {
        Self {
            cluster: cluster.to_string(),
            node: node.to_string(),
            monitor_state,
            sent_at_ms: now_ms(),
        }
    }

    pub fn encode(&self) -> TransportResult<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_PAYLOAD {
            return Err(TransportError::TooLarge {
                len: bytes.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(bytes)
    }

    /// Decode a payload, ignoring surrounding whitespace and zero padding.
    pub fn decode(bytes: &[u8]) -> TransportResult<Self> {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Ok(serde_json::from_slice(bytes[..end].trim_ascii())?)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_tolerates_padding_and_newline() {
        let msg = HbMessage::new("c1", "n1", MonitorState::Maintenance);
        let mut bytes = msg.encode().unwrap();
        bytes.push(b'\n');
        bytes.resize(MAX_PAYLOAD, 0);
        assert_eq!(HbMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn monitor_state_defaults_to_idle() {
        let msg = HbMessage::decode(br#"{"cluster":"c1","node":"n2","sent_at_ms":7}"#).unwrap();
        assert_eq!(msg.monitor_state, MonitorState::Idle);
        assert_eq!(msg.sent_at_ms, 7);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let msg = HbMessage::new("c1", &"n".repeat(MAX_PAYLOAD), MonitorState::Idle);
        assert!(matches!(msg.encode(), Err(TransportError::TooLarge { .. })));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(HbMessage::decode(b"not json"), Err(TransportError::Codec(_))));
        assert!(matches!(HbMessage::decode(&[0; 16]), Err(TransportError::Codec(_))));
    }
}
