//! Wire messages for the TunnelCow control protocol.
//!
//! Every message is one JSON object, newline-terminated on the wire
//! (see [`crate::codec`]). Tags are the exact strings from the spec;
//! unknown tags decode into [`Message::Unknown`] so the dispatch loop on
//! either end can ignore them without tearing the link down.

use serde::{Deserialize, Serialize};

use crate::inspect::InspectRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Client → Server. Request to open a public listener.
    ReqBind { public_port: u16, local_port: u16 },

    /// Client → Server. Request to close a public listener.
    ReqUnbind { public_port: u16 },

    /// Server → Client. First line of every inbound data substream.
    NewConn { public_port: u16 },

    /// Client → Server every 2s; echoed verbatim by the receiver.
    Ping { ts: i64 },

    /// Client → Server. Map a virtual host to a public port.
    ReqDomainMap {
        domain: String,
        public_port: u16,
        mode: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_pass: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rate_limit: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        smart_shield: Option<bool>,
    },

    /// Client → Server. Remove a domain mapping.
    ReqDomainUnmap { domain: String },

    /// Server → Client, on the control substream. A captured request/response.
    InspectData(InspectRecord),

    /// Catch-all for tags this build doesn't recognize. Never constructed
    /// by this crate's encoder; only produced by the decoder so dispatch
    /// loops can drop it silently per the protocol error taxonomy.
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tag_does_not_fail_decode() {
        let line = r#"{"type":"SOMETHING_FUTURE","payload":{"x":1}}"#;
        let msg: Message = serde_json::from_str(line).expect("unknown tags must decode");
        assert!(matches!(msg, Message::Unknown));
    }

    #[test]
    fn bind_round_trips() {
        let msg = Message::ReqBind {
            public_port: 9001,
            local_port: 7001,
        };
        let line = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&line).unwrap();
        match back {
            Message::ReqBind {
                public_port,
                local_port,
            } => {
                assert_eq!(public_port, 9001);
                assert_eq!(local_port, 7001);
            }
            _ => panic!("wrong variant"),
        }
    }
}
