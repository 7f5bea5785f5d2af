//! HTTP status/body -> `vol_api::error::ArrayError` classification
//! (spec.md §4.B "Request pipeline", §7 "Taxonomy").
//!
//! This is the one adapter (per Design Notes "Exception-for-control-flow")
//! allowed to match on response body text; nothing above this module ever
//! sees a raw status code or error string.

use serde_json::Value;
use vol_api::error::ArrayError;

use crate::dialect::ApiVersion;

/// An error message plus the structured code the v2 dialect may supply.
/// Per the Open Question in spec.md §9, callers should prefer `code` over
/// string-matching `message` when both are available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedError {
    pub message: String,
    pub code: Option<String>,
}

/// Pulls the error message (and v2 structured code, if any) out of a
/// response body. v2 uses `errors[].message` + `context`; v1 uses `msg`.
pub fn extract_error(version: ApiVersion, body: &Value) -> ExtractedError {
    match version {
        ApiVersion::V2 => extract_v2(body),
        ApiVersion::V1 => extract_v1(body),
    }
}

fn extract_v2(body: &Value) -> ExtractedError {
    let first = body
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errs| errs.first());

    let message = first
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| "unknown array error".to_owned());

    let context = first
        .and_then(|e| e.get("context"))
        .and_then(Value::as_str);

    let message = match context {
        Some(ctx) if !ctx.is_empty() => format!("{message} ({ctx})"),
        _ => message,
    };

    let code = first
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    ExtractedError { message, code }
}

fn extract_v1(body: &Value) -> ExtractedError {
    let message = body
        .get("msg")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| "unknown array error".to_owned());
    ExtractedError { message, code: None }
}

/// Appends a remediation hint for statuses where one is generically useful.
/// Per spec.md §4.B: hints apply to 401/403/404/409/quota/capacity/503.
pub fn hint_for(status: u16, message: &str) -> Option<&'static str> {
    let lower = message.to_ascii_lowercase();
    match status {
        401 => Some("check that the configured credentials are still valid"),
        403 => Some("the configured credentials lack permission for this operation"),
        404 => Some("the named object does not exist on the array"),
        409 if lower.contains("quota") => Some("the pod or array quota has been exceeded"),
        409 if lower.contains("capacity") => Some("the array is out of provisionable capacity"),
        409 => Some("the array reports a conflicting concurrent change"),
        503 => Some("the array is temporarily unavailable; this may be transient"),
        _ => None,
    }
}

/// True for the narrow "already exists"/"already connected"/"already in
/// use" class of 409 conflict that is benign from the orchestrator's
/// perspective (a peer, or our own retry, already did the thing).
pub fn is_benign_conflict_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["already exists", "already connected", "already in use"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Classifies a non-2xx response into the typed taxonomy. `is_idempotent`
/// distinguishes a non-idempotent POST (never retried on 5xx) from
/// everything else.
pub fn classify(
    status: u16,
    extracted: ExtractedError,
    is_idempotent: bool,
) -> ArrayError {
    let hint = hint_for(status, &extracted.message);
    match status {
        429 => ArrayError::Transient {
            status,
            message: extracted.message,
        },
        500..=599 if is_idempotent => ArrayError::Transient {
            status,
            message: extracted.message,
        },
        401 => ArrayError::AuthExpired {
            message: extracted.message,
        },
        404 => ArrayError::NotFound {
            message: extracted.message,
        },
        409 => ArrayError::Conflict {
            message: extracted.message,
            code: extracted.code,
            hint,
        },
        _ => ArrayError::Rejected {
            status,
            message: match hint {
                Some(h) => format!("{} ({h})", extracted.message),
                None => extracted.message,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_v2_message_with_context_and_code() {
        let body = json!({"errors": [{"message": "not found", "context": "volume", "code": "ERR_NOT_FOUND"}]});
        let extracted = extract_error(ApiVersion::V2, &body);
        assert_eq!(extracted.message, "not found (volume)");
        assert_eq!(extracted.code.as_deref(), Some("ERR_NOT_FOUND"));
    }

    #[test]
    fn extracts_v1_msg_field() {
        let body = json!({"msg": "does not exist"});
        let extracted = extract_error(ApiVersion::V1, &body);
        assert_eq!(extracted.message, "does not exist");
        assert_eq!(extracted.code, None);
    }

    #[test]
    fn classifies_5xx_as_transient_only_when_idempotent() {
        let err = ExtractedError { message: "boom".to_owned(), code: None };
        match classify(503, err.clone(), true) {
            ArrayError::Transient { .. } => {}
            other => panic!("expected Transient, got {other:?}"),
        }
        match classify(503, err, false) {
            ArrayError::Rejected { .. } => {}
            other => panic!("expected Rejected for non-idempotent POST, got {other:?}"),
        }
    }

    #[test]
    fn recognizes_benign_conflicts() {
        assert!(is_benign_conflict_message("Volume already exists"));
        assert!(is_benign_conflict_message("host already connected to volume"));
        assert!(!is_benign_conflict_message("snapshot has dependent volume"));
    }

    #[test]
    fn conflict_carries_structured_code_when_present() {
        let extracted = ExtractedError {
            message: "has dependent volume".to_owned(),
            code: Some("ERR_HAS_DEPENDENTS".to_owned()),
        };
        match classify(409, extracted, true) {
            ArrayError::Conflict { code: Some(c), .. } => assert_eq!(c, "ERR_HAS_DEPENDENTS"),
            other => panic!("expected Conflict with code, got {other:?}"),
        }
    }
}
