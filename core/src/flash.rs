//! Flash-message codec
//!
//! A flash message is a short, single-read notification carried across an
//! HTTP redirect in a cookie. This module only implements the wire codec;
//! reading/writing the actual `Set-Cookie` header is the HTTP layer's job
//! (`envdeploy-server::flash`), matching this crate's preference for
//! keeping HTTP concerns out of `envdeploy-core`.
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::Serialize;

pub const FLASH_COOKIE_NAME: &str = "flash";

/// A single flash message: an identifier (e.g. `"success"`, `"error"`) plus
/// positional string arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashMessage {
    pub id: String,
    pub args: Vec<String>,
}

impl FlashMessage {
    pub fn new(id: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            args,
        }
    }
}

/// Encodes a list of flash messages into a cookie value
///
/// Messages are joined with NUL, and within a message the id and its
/// arguments are joined with `\x01`, then the whole buffer is
/// URL-safe-base64-encoded.
pub fn encode(messages: &[FlashMessage]) -> String {
    let mut buf = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        if i > 0 {
            buf.push(0);
        }
        buf.extend_from_slice(message.id.as_bytes());
        for arg in &message.args {
            buf.push(1);
            buf.extend_from_slice(arg.as_bytes());
        }
    }
    URL_SAFE.encode(buf)
}

/// Decodes a cookie value back into its flash messages
///
/// Returns `None` if the value is not valid base64 -- callers should treat
/// that the same as "no flash messages", since a tampered or stale cookie
/// is not worth surfacing as an error.
pub fn decode(value: &str) -> Option<Vec<FlashMessage>> {
    let raw = URL_SAFE.decode(value).ok()?;
    let raw = String::from_utf8_lossy(&raw);

    let messages = raw
        .split('\u{0}')
        .map(|s| {
            let mut parts = s.split('\u{1}');
            let id = parts.next().unwrap_or_default().to_string();
            let args = parts.map(str::to_string).collect();
            FlashMessage { id, args }
        })
        .collect();

    Some(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_stable() {
        let messages = vec![
            FlashMessage::new("success", vec!["Deployment successful".to_string()]),
            FlashMessage::new("error", vec!["job with the ID already exists".to_string()]),
        ];
        let encoded = encode(&messages);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn decode_garbage_returns_none() {
        assert!(decode("not valid base64!!!").is_none());
    }
}
