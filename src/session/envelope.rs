//! `{type, sdp}` signaling envelope exchanged over the broker

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SignalingEnvelope {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Parse a UTF-8 JSON envelope and check it carries `expected` with a non-empty SDP.
    pub fn parse(payload: &[u8], expected: SdpKind) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::Envelope(format!("payload is not UTF-8: {}", e)))?;
        let envelope: SignalingEnvelope =
            serde_json::from_str(text).map_err(|e| Error::Envelope(e.to_string()))?;

        if envelope.kind != expected {
            return Err(Error::Envelope(format!(
                "expected {:?}, got {:?}",
                expected, envelope.kind
            )));
        }
        if envelope.sdp.trim().is_empty() {
            return Err(Error::Envelope("empty sdp".into()));
        }
        Ok(envelope)
    }

    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_type_field() {
        let payload = SignalingEnvelope::offer("v=0\r\n").to_payload().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");
    }

    #[test]
    fn parses_answer() {
        let env = SignalingEnvelope::parse(br#"{"type":"answer","sdp":"v=0"}"#, SdpKind::Answer)
            .unwrap();
        assert_eq!(env, SignalingEnvelope::answer("v=0"));
    }

    #[test]
    fn rejects_wrong_kind() {
        let err = SignalingEnvelope::parse(br#"{"type":"offer","sdp":"v=0"}"#, SdpKind::Answer)
            .unwrap_err();
        assert!(matches!(err, Error::Envelope(_)));
    }

    #[test]
    fn rejects_malformed_payloads() {
        for payload in [
            &b"not json"[..],
            &br#"{"type":"answer"}"#[..],
            &br#"{"type":"pranswer","sdp":"v=0"}"#[..],
            &br#"{"type":"answer","sdp":"   "}"#[..],
            &[0xff, 0xfe][..],
        ] {
            assert!(
                SignalingEnvelope::parse(payload, SdpKind::Answer).is_err(),
                "{:?}",
                String::from_utf8_lossy(payload)
            );
        }
    }
}
