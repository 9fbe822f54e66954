//! Wire envelope, reserved namespaces, and addressing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use super::error::GatewayError;

// ---------------------------------------------------------------------------
// Reserved namespaces
// ---------------------------------------------------------------------------

/// Control namespaces handled by the gateway itself.
pub mod ns {
    /// Client → server: bind the connection to a session and resource.
    /// Server → client: acknowledgement.
    pub const HANDSHAKE: &str = "handshake";
    /// Client → server: explicit close.
    pub const CLOSE: &str = "close";
    /// Client → server heartbeat.
    pub const PING: &str = "ping";
    /// Server → client heartbeat reply.
    pub const PONG: &str = "pong";
    /// Server → client failure report.
    pub const ERROR: &str = "error";
    /// Server → client: first frame of a side-channel transport.
    pub const OPEN: &str = "open";

    pub const RESERVED: [&str; 6] = [HANDSHAKE, CLOSE, PING, PONG, ERROR, OPEN];
}

/// Whether `namespace` is a control namespace that never leaves the gateway.
pub fn is_control(namespace: &str) -> bool {
    ns::RESERVED.contains(&namespace)
}

/// Recipient used for broadcast delivery.
pub const BROADCAST: &str = "*";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A message in either direction, carried as JSON text over any transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Envelope {
    /// Session of the sender (client traffic) or of the implicit recipient
    /// (backend replies without `to`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Handling domain. Required.
    pub ns: String,
    /// `session/resource` of the originating endpoint, set by the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// `session`, `session/resource`, or `*`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Opaque payload.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Value,
    /// Higher is delivered first within one endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Per-endpoint delivery sequence, stamped on the way out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Envelope {
    /// An application message with no addressing.
    pub fn new(namespace: impl Into<String>, data: Value) -> Self {
        Self {
            session: None,
            ns: namespace.into(),
            from: None,
            to: None,
            data,
            priority: None,
            seq: None,
        }
    }

    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.to = Some(recipient.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Build an `error` control message.
    pub fn error(err: &GatewayError) -> Self {
        Self::new(
            ns::ERROR,
            serde_json::json!({ "code": err.code(), "message": err.to_string() }),
        )
    }

    /// Build a `pong` reply echoing the ping payload.
    pub fn pong(data: Value) -> Self {
        Self::new(ns::PONG, data)
    }

    /// Build the `open` frame announcing a side-channel connection id.
    pub fn open(connection_id: &str, transport: &str) -> Self {
        Self::new(
            ns::OPEN,
            serde_json::json!({ "connection_id": connection_id, "transport": transport }),
        )
    }

    pub fn is_control(&self) -> bool {
        is_control(&self.ns)
    }

    /// Reject envelopes without a namespace.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.ns.trim().is_empty() {
            return Err(GatewayError::Malformed("namespace is required".into()));
        }
        Ok(())
    }

    /// Parsed `to` field, if any.
    pub fn recipient(&self) -> Result<Option<Recipient>, GatewayError> {
        match self.to.as_deref() {
            None => Ok(None),
            Some(to) => Recipient::parse(to)
                .map(Some)
                .ok_or_else(|| GatewayError::Malformed(format!("invalid recipient '{to}'"))),
        }
    }
}

/// Decode one transport frame. A frame holds either one envelope or a JSON
/// array of envelopes (side-channel batches).
pub fn parse_frame(text: &str) -> Result<Vec<Envelope>, GatewayError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| GatewayError::Malformed(format!("invalid JSON: {e}")))?;
    let envelopes = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Envelope>, _>>(),
        other => serde_json::from_value(other).map(|e| vec![e]),
    }
    .map_err(|e| GatewayError::Malformed(e.to_string()))?;

    for envelope in &envelopes {
        envelope.validate()?;
    }
    Ok(envelopes)
}

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// Resolved form of an envelope's `to` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Every live endpoint.
    Broadcast,
    /// Every endpoint of one session.
    Session(String),
    /// One (session, resource) endpoint.
    Endpoint { session: String, resource: String },
}

impl Recipient {
    pub fn parse(to: &str) -> Option<Self> {
        let to = to.trim();
        if to.is_empty() {
            return None;
        }
        if to == BROADCAST {
            return Some(Recipient::Broadcast);
        }
        match to.split_once('/') {
            Some((session, resource)) if !session.is_empty() && !resource.is_empty() => {
                Some(Recipient::Endpoint {
                    session: session.to_string(),
                    resource: resource.to_string(),
                })
            }
            Some(_) => None,
            None => Some(Recipient::Session(to.to_string())),
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Broadcast => f.write_str(BROADCAST),
            Recipient::Session(session) => f.write_str(session),
            Recipient::Endpoint { session, resource } => write!(f, "{session}/{resource}"),
        }
    }
}

/// `session/resource` address of an endpoint.
pub fn endpoint_address(session: &str, resource: &str) -> String {
    format!("{session}/{resource}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_frame_accepts_single_and_batch() {
        let one = parse_frame(r#"{"ns":"chat","data":{"text":"hi"}}"#).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].ns, "chat");
        assert_eq!(one[0].data["text"], "hi");

        let many = parse_frame(r#"[{"ns":"a"},{"ns":"b","to":"ses_1","priority":3}]"#).unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].to.as_deref(), Some("ses_1"));
        assert_eq!(many[1].priority, Some(3));
    }

    #[test]
    fn parse_frame_requires_namespace() {
        assert!(matches!(
            parse_frame(r#"{"data":{}}"#),
            Err(GatewayError::Malformed(_))
        ));
        assert!(matches!(
            parse_frame(r#"{"ns":"  "}"#),
            Err(GatewayError::Malformed(_))
        ));
        assert!(matches!(parse_frame("not json"), Err(GatewayError::Malformed(_))));
    }

    #[test]
    fn recipient_forms() {
        assert_eq!(Recipient::parse("*"), Some(Recipient::Broadcast));
        assert_eq!(
            Recipient::parse("ses_1"),
            Some(Recipient::Session("ses_1".into()))
        );
        assert_eq!(
            Recipient::parse("ses_1/Browser/tab 2"),
            Some(Recipient::Endpoint {
                session: "ses_1".into(),
                resource: "Browser/tab 2".into()
            })
        );
        assert_eq!(Recipient::parse("ses_1/"), None);
        assert_eq!(Recipient::parse(""), None);
    }

    #[test]
    fn control_namespaces_are_reserved() {
        assert!(is_control("handshake"));
        assert!(is_control("ping"));
        assert!(!is_control("chat"));
    }

    #[test]
    fn serialization_skips_empty_fields() {
        let json = serde_json::to_value(Envelope::new("chat", serde_json::json!(1))).unwrap();
        assert_eq!(json, serde_json::json!({ "ns": "chat", "data": 1 }));
    }

    #[test]
    fn error_envelope_carries_code() {
        let env = Envelope::error(&GatewayError::HandshakeTimeout);
        assert_eq!(env.ns, ns::ERROR);
        assert_eq!(env.data["code"], "HANDSHAKE_TIMEOUT");
    }
}
