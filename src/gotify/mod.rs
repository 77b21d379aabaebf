pub mod stream;

use serde::{Deserialize, Serialize};

/// A notification pushed by Gotify over the `/stream` WebSocket
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SourceMessage {
    pub id: u32,
    pub appid: u32,
    pub message: String,
    pub title: String,
    pub priority: u32,
    pub date: String,
    /// Application-specific extras (e.g. `client::display`), passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
}

impl SourceMessage {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_gotify_frame() {
        let frame = r#"{"id":42,"appid":3,"message":"Disk almost full","title":"backup",
            "priority":8,"date":"2024-05-01T10:00:00.123+02:00"}"#;
        let msg = SourceMessage::from_json(frame).unwrap();
        assert_eq!(msg.id, 42);
        assert_eq!(msg.appid, 3);
        assert_eq!(msg.title, "backup");
        assert_eq!(msg.message, "Disk almost full");
        assert_eq!(msg.priority, 8);
        assert!(msg.extras.is_none());
    }

    #[test]
    fn test_decode_keeps_extras() {
        let frame = r#"{"id":1,"appid":1,"message":"m","title":"t","priority":0,"date":"d",
            "extras":{"client::display":{"contentType":"text/markdown"}}}"#;
        let msg = SourceMessage::from_json(frame).unwrap();
        let extras = msg.extras.unwrap();
        assert_eq!(
            extras["client::display"]["contentType"],
            serde_json::json!("text/markdown")
        );
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        assert!(SourceMessage::from_json(r#"{"id":1,"title":"t"}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_negative_ids() {
        let frame = r#"{"id":-1,"appid":1,"message":"m","title":"t","priority":0,"date":"d"}"#;
        assert!(SourceMessage::from_json(frame).is_err());
    }
}
