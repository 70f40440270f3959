//! `X-Hub-Signature` verification (HMAC-SHA1 over the raw request body).

use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";
const SIGNATURE_PREFIX: &str = "sha1=";

/// Computes the header value a sender holding `secret` would attach to `payload`.
#[cfg(test)]
pub(crate) fn expected_signature(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Checks `signature_header` ("sha1=<hex>") against the HMAC of `payload`.
///
/// Missing or malformed headers never verify. The digest comparison is
/// constant-time.
pub fn verify_hub_signature(secret: &str, payload: &[u8], signature_header: Option<&str>) -> bool {
    let Some(header) = signature_header else {
        debug!("No {} header supplied", SIGNATURE_HEADER);
        return false;
    };

    let Some(hex_sig) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        debug!("Signature header without '{}' prefix", SIGNATURE_PREFIX);
        return false;
    };

    let Ok(received) = hex::decode(hex_sig) else {
        debug!("Signature header is not valid hex");
        return false;
    };

    let mut mac = match HmacSha1::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&received).is_ok()
}
