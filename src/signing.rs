// ─────────────────────────────────────────────────────────────────────────────
// signing.rs — Bitget request signing
//
// Private endpoints are signed with HMAC-SHA256 over the concatenation
//   timestamp + UPPERCASE(method) + request_path_with_query + body
// and the digest is sent base64-encoded alongside the key, passphrase and
// millisecond timestamp headers.
// ─────────────────────────────────────────────────────────────────────────────
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

/// Computes the base64 signature for one request.
///
/// `path_with_query` must be exactly the string sent on the wire, including
/// the leading slash and any `?k=v` query — the exchange re-derives the
/// signature from the raw request line.
pub fn sign_request(
    secret_key: &str,
    timestamp_ms: i64,
    method: &str,
    path_with_query: &str,
    body: &str,
) -> String {
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .expect("hmac-sha256 accepts any key length");
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(method.to_uppercase().as_bytes());
    mac.update(path_with_query.as_bytes());
    mac.update(body.as_bytes());
    B64.encode(mac.finalize().into_bytes())
}
