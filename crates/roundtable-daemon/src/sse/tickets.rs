//! Short-lived signed tickets for SSE connections.
//!
//! Browsers cannot attach auth headers to EventSource, so the main
//! credential stays in headers and a 60-second, room-scoped HMAC ticket
//! appears in the URL instead.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::domain::RoomId;

type HmacSha256 = Hmac<Sha256>;

/// Generate a ticket bound to a room and user, valid for `ttl_secs`.
///
/// Format: `room_id:user_id:expiry:signature` with a hex HMAC-SHA256
/// signature over the first three fields.
pub fn generate_ticket(secret: &str, room_id: RoomId, user_id: &str, ttl_secs: u64) -> String {
    let expiry = chrono::Utc::now().timestamp() + ttl_secs as i64;
    let payload = format!("{}:{}:{}", room_id.0, user_id, expiry);
    let signature = sign(secret, &payload);
    format!("{payload}:{signature}")
}

/// Validate a ticket against a room: signature must verify and the expiry
/// must be in the future.
pub fn validate_ticket(secret: &str, ticket: &str, room_id: RoomId) -> bool {
    let parts: Vec<&str> = ticket.splitn(4, ':').collect();
    let [room_part, user_part, expiry_part, signature] = parts.as_slice() else {
        return false;
    };

    if room_part.parse::<i64>() != Ok(room_id.0) {
        return false;
    }
    let Ok(expiry) = expiry_part.parse::<i64>() else {
        return false;
    };
    if expiry <= chrono::Utc::now().timestamp() {
        return false;
    }

    let payload = format!("{room_part}:{user_part}:{expiry_part}");
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn sign(secret: &str, payload: &str) -> String {
    // new_from_slice only fails on invalid key lengths; HMAC accepts any.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
