use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const EVENT_HEADER: &str = "X-Event";

fn mac_for(secret: &str, timestamp: i64, body: &str) -> anyhow::Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| anyhow::anyhow!("invalid webhook secret: {err}"))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    Ok(mac)
}

/// Hex HMAC-SHA256 over `"<timestamp>.<body>"`.
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> anyhow::Result<String> {
    let mac = mac_for(secret, timestamp, body)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Receiver-side check, constant time. Clock-skew policy is left to the caller.
pub fn verify_signature(secret: &str, timestamp: i64, body: &str, signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    match mac_for(secret, timestamp, body) {
        Ok(mac) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}
