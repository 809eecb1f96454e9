//! Bearer token claim decoding
//!
//! Tokens are compact three-segment JWTs whose middle segment is a base64url
//! JSON payload. The engine never verifies signatures (that is the backend's
//! job); it only reads the claims it needs: `sub`, `email` and `exp`.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde_json::Value;

use super::models::SessionUser;

/// Look-ahead window applied when deciding whether a token is stale.
pub const TOKEN_REFRESH_BUFFER_SECONDS: i64 = 60;

/// Decodes the claims payload of a bearer token.
///
/// Returns `None` for anything that is not a token with a decodable JSON
/// object in its second segment.
pub fn decode_jwt_payload(token: &str) -> Option<Value> {
    let payload_raw = token.split('.').nth(1)?;
    if payload_raw.is_empty() {
        return None;
    }

    // base64url to standard base64, padded to a multiple of 4.
    let mut normalized: String = payload_raw
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while normalized.len() % 4 != 0 {
        normalized.push('=');
    }

    let bytes = BASE64_STANDARD.decode(normalized).ok()?;
    let payload: Value = serde_json::from_slice(&bytes).ok()?;
    payload.is_object().then_some(payload)
}

/// Extracts the user identity from an access token.
///
/// Requires a string `sub` claim; `email` is optional. Returns `None` when no
/// subject can be extracted, in which case callers must treat the whole
/// session as absent.
pub fn parse_user_from_jwt(access_token: &str) -> Option<SessionUser> {
    let payload = decode_jwt_payload(access_token)?;
    let id = payload.get("sub")?.as_str()?.to_string();
    let email = payload
        .get("email")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(SessionUser { id, email })
}

/// Classifies a token as expired when it expires within `buffer_seconds`.
///
/// A token with no parseable `exp` claim is always expired (fail-closed).
pub fn is_token_expired(access_token: &str, buffer_seconds: i64) -> bool {
    let Some(payload) = decode_jwt_payload(access_token) else {
        return true;
    };
    let Some(exp) = payload.get("exp").and_then(Value::as_f64) else {
        return true;
    };
    (Utc::now().timestamp() + buffer_seconds) as f64 >= exp
}
