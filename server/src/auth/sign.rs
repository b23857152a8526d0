use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `message` keyed by `secret`.
///
/// Used both for answering authority challenges and for signing download
/// links (`sign = hex(HMAC(secret, hash))`).
pub fn sign(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check `signature` against `sign(secret, message)` in constant time.
///
/// Only the exact lowercase hex string is accepted.
pub fn verify(secret: &str, message: &str, signature: &str) -> bool {
    let expected = sign(secret, message);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}
