//! Request-signing utilities shared by the exchange clients
//!
//! Every supported exchange authenticates with an HMAC-SHA256 over some
//! concatenation of timestamp, method, path and body/query; they differ only
//! in the message layout and whether the digest is hex- or base64-encoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::common::errors::{GatewayError, GatewayResult};
use crate::common::types::Exchange;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(exchange: Exchange, secret: &str, message: &str) -> GatewayResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
        GatewayError::Authentication {
            exchange,
            message: format!("failed to build HMAC from secret: {}", e),
        }
    })?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Hex-encoded HMAC-SHA256 (Binance, Bybit, MEXC convention)
pub fn hmac_sha256_hex(exchange: Exchange, secret: &str, message: &str) -> GatewayResult<String> {
    Ok(hex::encode(hmac_sha256(exchange, secret, message)?))
}

/// Base64-encoded HMAC-SHA256 (OKX, KuCoin convention)
pub fn hmac_sha256_base64(
    exchange: Exchange,
    secret: &str,
    message: &str,
) -> GatewayResult<String> {
    Ok(BASE64.encode(hmac_sha256(exchange, secret, message)?))
}

/// Join pre-encoded key/value pairs into a query string.
///
/// Values here are symbols, timestamps and decimal quantities; none of them
/// require percent-encoding.
pub fn query_string(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}
