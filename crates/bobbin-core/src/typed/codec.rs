//! MessageCodec - Envelope と bytes の相互変換
//!
//! JSON で、`link` / `link_error` に入れ子になった canvas も含めて可逆です。
//! decode に失敗したメッセージは worker が poison message として扱います。

use crate::domain::Envelope;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed message body: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub const CONTENT_TYPE: &'static str = "application/json";

    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(envelope).map_err(CodecError::Encode)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Canvas, GroupId, Signature, TaskId, chord};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use serde_json::json;

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn roundtrip_with_nested_links_and_null_eta() {
        let errback = Signature::new("tasks.on_error").immutable();
        let next: Canvas = chord(
            [Signature::new("tasks.p1"), Signature::new("tasks.p2")],
            Signature::new("tasks.aggregate").link(Signature::new("tasks.notify")),
        )
        .into();
        let sig = Signature::new("tasks.fetch")
            .arg("https://example.invalid")
            .link(next)
            .link_error(errback);

        let env = Envelope::from_signature(sig, TaskId::generate(), now())
            .in_group(GroupId::generate(), 2, Some(3));
        assert!(env.kwargs.is_empty());
        assert!(env.eta.is_none());

        let codec = MessageCodec;
        let bytes = codec.encode(&env).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), env);
    }

    #[rstest]
    #[case::not_json(b"\xff\xfe".to_vec())]
    #[case::wrong_shape(br#"{"hello": "world"}"#.to_vec())]
    #[case::bad_id(br#"{"id": "nope", "task": "x"}"#.to_vec())]
    fn malformed_bytes_are_rejected(#[case] bytes: Vec<u8>) {
        assert!(matches!(
            MessageCodec.decode(&bytes),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn missing_optional_fields_default() {
        let id = TaskId::generate();
        let raw = json!({"id": id.key(), "task": "tasks.ping"});
        let env = MessageCodec
            .decode(&serde_json::to_vec(&raw).unwrap())
            .unwrap();
        assert_eq!(env.id, id);
        assert_eq!(env.retries, 0);
        assert!(env.args.is_empty());
        assert!(env.link.is_empty());
    }
}
