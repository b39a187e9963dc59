use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{FirestoreError, FirestoreErrorCode};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<RpcStatus>,
}

#[derive(Debug, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Maps an `{"error": {"code" | "status", "message"}}` stream payload to the
/// error it carries, or `None` for ordinary messages.
pub fn decode_rpc_error(payload: &JsonValue) -> Option<FirestoreError> {
    let body = ErrorBody::deserialize(payload).ok()?;
    let status = body.error?;
    let code = match (status.code, status.status.as_deref()) {
        (Some(code), _) => FirestoreErrorCode::from_rpc_status(code),
        (None, Some(name)) => FirestoreErrorCode::from_status_name(name),
        (None, None) => FirestoreErrorCode::Unknown,
    };
    let message = status
        .message
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| format!("Stream failed with {}", code.as_str()));
    Some(FirestoreError::new(code, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_numeric_and_named_status() {
        let numeric = decode_rpc_error(&json!({"error": {"code": 8, "message": "slow down"}})).unwrap();
        assert_eq!(numeric.code, FirestoreErrorCode::ResourceExhausted);
        assert_eq!(numeric.message(), "slow down");

        let named = decode_rpc_error(&json!({"error": {"status": "PERMISSION_DENIED"}})).unwrap();
        assert_eq!(named.code, FirestoreErrorCode::PermissionDenied);
        assert!(named.message().contains("permission-denied"));
    }

    #[test]
    fn ordinary_messages_are_not_errors() {
        assert!(decode_rpc_error(&json!({"targetChange": {"targetChangeType": "ADD"}})).is_none());
        assert!(decode_rpc_error(&json!("text")).is_none());
    }
}
