//! Signaling envelopes
//!
//! The unit exchanged between negotiators through the relay. On the wire an
//! envelope is a JSON text frame `{ "event": .., "data": .., "target": .., "from": .. }`.
//! The payload is kept as raw JSON so the relay forwards it byte-for-byte
//! without ever looking inside.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

use crate::error::EnvelopeError;
use crate::model::endpoint::EndpointId;

/// The kind of an envelope, taken from its `event` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Offer,
    Answer,
    Candidate,
    /// Any other event name. Tolerated and forwarded, never rejected.
    Other(String),
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::Candidate => "candidate",
            EnvelopeKind::Other(name) => name,
        }
    }
}

impl From<&str> for EnvelopeKind {
    fn from(event: &str) -> Self {
        match event {
            "offer" => EnvelopeKind::Offer,
            "answer" => EnvelopeKind::Answer,
            "candidate" => EnvelopeKind::Candidate,
            other => EnvelopeKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable signaling message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    event: String,
    /// `None` only when the field is absent; an explicit `null` is kept raw.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    data: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<EndpointId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<EndpointId>,
}

impl Envelope {
    /// Build an envelope around a serializable payload.
    pub fn new<T: Serialize + ?Sized>(
        kind: EnvelopeKind,
        payload: &T,
        target: Option<EndpointId>,
    ) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope {
            event: kind.as_str().to_string(),
            data: Some(serde_json::value::to_raw_value(payload)?),
            target,
            from: None,
        })
    }

    /// Decode a raw frame. Only `event` is required; `data` is never inspected.
    pub fn parse(raw: &[u8]) -> Result<Envelope, EnvelopeError> {
        let text = std::str::from_utf8(raw)?;
        let envelope: Envelope = serde_json::from_str(text)?;

        if envelope.event.trim().is_empty() {
            return Err(EnvelopeError::MissingKind);
        }

        Ok(envelope)
    }

    pub fn kind(&self) -> EnvelopeKind {
        EnvelopeKind::from(self.event.as_str())
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn data(&self) -> Option<&RawValue> {
        self.data.as_deref()
    }

    pub fn target(&self) -> Option<EndpointId> {
        self.target
    }

    /// Sender identity as attested by the relay.
    pub fn from(&self) -> Option<EndpointId> {
        self.from
    }

    /// Decode the payload into a concrete type. A missing payload decodes as `null`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.data {
            Some(raw) => serde_json::from_str(raw.get()),
            None => serde_json::from_str("null"),
        }
    }

    /// Copy stamped with the relay-attested sender. Whatever `from` the sender
    /// supplied is replaced; event, data and target are carried unchanged.
    pub fn forwarded_from(&self, sender: EndpointId) -> Envelope {
        Envelope {
            from: Some(sender),
            ..self.clone()
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn present<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_keeps_payload_verbatim() {
        let raw = br#"{"event":"offer","data":{"sdp":"X",  "type":"offer"},"target":7}"#;
        let envelope = Envelope::parse(raw).unwrap();

        assert_eq!(envelope.kind(), EnvelopeKind::Offer);
        assert_eq!(envelope.target(), Some(EndpointId::from_raw(7)));
        assert_eq!(envelope.data().unwrap().get(), r#"{"sdp":"X",  "type":"offer"}"#);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(Envelope::parse(b"not json"), Err(EnvelopeError::Json(_))));
        assert!(matches!(
            Envelope::parse(br#"{"data":{}}"#),
            Err(EnvelopeError::Json(_))
        ));
        assert!(matches!(
            Envelope::parse(br#"{"event":"  ","data":{}}"#),
            Err(EnvelopeError::MissingKind)
        ));
        assert!(matches!(
            Envelope::parse(&[0xff, 0xfe, 0x00]),
            Err(EnvelopeError::Utf8(_))
        ));
    }

    #[test]
    fn test_unknown_event_is_tolerated() {
        let envelope = Envelope::parse(br#"{"event":"chat","data":"hi"}"#).unwrap();
        assert_eq!(envelope.kind(), EnvelopeKind::Other("chat".to_string()));
        assert_eq!(envelope.payload::<String>().unwrap(), "hi");
    }

    #[test]
    fn test_forwarded_from_overwrites_sender() {
        let raw = br#"{"event":"candidate","data":{"candidate":"c"},"from":99}"#;
        let envelope = Envelope::parse(raw).unwrap();
        let forwarded = envelope.forwarded_from(EndpointId::from_raw(3));

        let value: serde_json::Value = serde_json::from_str(&forwarded.to_frame().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event": "candidate", "data": {"candidate": "c"}, "from": 3})
        );
        assert_eq!(envelope.from(), Some(EndpointId::from_raw(99)));
    }

    #[test]
    fn test_null_data_is_not_dropped() {
        let envelope = Envelope::parse(br#"{"event":"bye","data":null}"#).unwrap();
        assert_eq!(envelope.data().map(RawValue::get), Some("null"));

        let frame = envelope.forwarded_from(EndpointId::from_raw(2)).to_frame().unwrap();
        assert_eq!(frame, r#"{"event":"bye","data":null,"from":2}"#);

        let bare = Envelope::parse(br#"{"event":"bye"}"#).unwrap();
        assert_eq!(bare.to_frame().unwrap(), r#"{"event":"bye"}"#);
    }

    #[test]
    fn test_missing_data_decodes_as_null() {
        let envelope = Envelope::parse(br#"{"event":"answer"}"#).unwrap();
        assert!(envelope.data().is_none());
        assert_eq!(envelope.payload::<Option<String>>().unwrap(), None);
    }
}
