//! Request signing primitives shared by the venue adapters

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};

use crate::error::ExchangeError;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

fn mac256(secret: &str, message: &str) -> Result<Vec<u8>, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(format!("invalid HMAC key: {e}")))?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Hex HMAC-SHA256 (Bybit, Binance, BingX)
pub fn hmac_sha256_hex(secret: &str, message: &str) -> Result<String, ExchangeError> {
    Ok(hex::encode(mac256(secret, message)?))
}

/// Base64 HMAC-SHA256 (OKX, Bitget)
pub fn hmac_sha256_base64(secret: &str, message: &str) -> Result<String, ExchangeError> {
    Ok(general_purpose::STANDARD.encode(mac256(secret, message)?))
}

/// Bithumb: base64 of the hex HMAC-SHA512 digest
pub fn hmac_sha512_hex_base64(secret: &str, message: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(format!("invalid HMAC key: {e}")))?;
    mac.update(message.as_bytes());
    let hex_digest = hex::encode(mac.finalize().into_bytes());
    Ok(general_purpose::STANDARD.encode(hex_digest.as_bytes()))
}

pub fn sha512_hex(data: &str) -> String {
    hex::encode(Sha512::digest(data.as_bytes()))
}

/// Compact HS256 JWT (Upbit auth)
pub fn jwt_hs256(claims: &Value, secret: &str) -> Result<String, ExchangeError> {
    let header = serde_json::json!({"alg": "HS256", "typ": "JWT"});
    let engine = general_purpose::URL_SAFE_NO_PAD;
    let signing_input = format!(
        "{}.{}",
        engine.encode(header.to_string().as_bytes()),
        engine.encode(claims.to_string().as_bytes())
    );
    let signature = engine.encode(mac256(secret, &signing_input)?);
    Ok(format!("{signing_input}.{signature}"))
}

/// `k=v&k=v` with values percent-encoded, preserving parameter order.
pub fn query_string(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_hex_matches_known_vector() {
        // RFC 4231 test case 2
        let sig = hmac_sha256_hex("Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn jwt_has_three_segments_and_verifies() {
        let claims = serde_json::json!({"access_key": "ak", "nonce": "n"});
        let token = jwt_hs256(&claims, "secret").unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let expected = general_purpose::URL_SAFE_NO_PAD
            .encode(mac256("secret", &format!("{}.{}", parts[0], parts[1])).unwrap());
        assert_eq!(parts[2], expected);
    }

    #[test]
    fn query_string_encodes_values_in_order() {
        let qs = query_string(&[("symbol", "BTC-USDT".into()), ("note", "a b".into())]);
        assert_eq!(qs, "symbol=BTC-USDT&note=a%20b");
    }
}
