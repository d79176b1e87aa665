//! Text codec for the structured blobs stored next to each download:
//! request headers, extras and the error payload.
//!
//! Encoding never fails from the caller's point of view; a value that cannot
//! be serialized is stored as an empty JSON object. Decoding is lenient in
//! the same way: text that does not look like JSON, or does not parse into
//! the requested type, yields `None`.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Stored in place of a value that failed to serialize.
pub const EMPTY_OBJECT: &str = "{}";

/// Serialize `value` to its stored text form.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode metadata, storing empty object");
            EMPTY_OBJECT.to_string()
        }
    }
}

/// Cheap shape check run before handing text to the parser.
pub fn may_be_json(text: &str) -> bool {
    let text = text.trim();
    text == "null"
        || (text.starts_with('[') && text.ends_with(']'))
        || (text.starts_with('{') && text.ends_with('}'))
}

/// Parse stored text back into `T`.
pub fn decode<T: DeserializeOwned>(text: &str) -> Option<T> {
    if !may_be_json(text) {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = %e, "Stored metadata did not decode");
            None
        }
    }
}

/// Parse stored text, falling back to `T::default()`.
pub fn decode_or_default<T: DeserializeOwned + Default>(text: &str) -> T {
    decode(text).unwrap_or_default()
}

/// [`decode`] on the blocking pool.
///
/// Large payloads (captured server responses inside an error blob, big extras
/// maps) are CPU-bound to parse; async callers should decode them here
/// rather than on a runtime worker.
pub async fn decode_off_thread<T>(text: String) -> Result<Option<T>, tokio::task::JoinError>
where
    T: DeserializeOwned + Send + 'static,
{
    tokio::task::spawn_blocking(move || decode(&text)).await
}
