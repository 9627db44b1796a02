//! Shared HTTP response handling for the exchange clients

use reqwest::{Response, StatusCode};

use crate::common::errors::{GatewayError, GatewayResult};
use crate::common::types::Exchange;

/// Map an HTTP response into the normalized error taxonomy, returning the
/// response untouched when the status is a success.
pub async fn check_response(exchange: Exchange, response: Response) -> GatewayResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_status(exchange, status, &body))
}

fn classify_status(exchange: Exchange, status: StatusCode, body: &str) -> GatewayError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Authentication {
            exchange,
            message: truncate(body),
        },
        // 418 is Binance's escalated IP ban for repeat 429 offenders.
        StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => GatewayError::RateLimit {
            exchange,
            message: truncate(body),
        },
        s if s.is_server_error() => {
            GatewayError::TransientNetwork(format!("[{}] HTTP {}: {}", exchange, s, truncate(body)))
        }
        s => classify_body(exchange, &format!("HTTP {}: {}", s, truncate(body))),
    }
}

/// Classify an exchange-level rejection delivered inside a 200 response
/// (OKX `code`, Bybit `retCode`, KuCoin `code` conventions) or a 4xx body.
pub fn classify_body(exchange: Exchange, message: &str) -> GatewayError {
    let lowered = message.to_lowercase();

    // "access-key" covers the hyphenated OKX/KuCoin header names quoted in
    // their rejection messages ("Invalid OK-ACCESS-KEY").
    if [
        "invalid api",
        "api key",
        "access-key",
        "signature",
        "unauthorized",
        "forbidden",
        "passphrase",
    ]
    .iter()
    .any(|needle| lowered.contains(needle))
    {
        return GatewayError::Authentication {
            exchange,
            message: message.to_string(),
        };
    }

    if ["rate limit", "too many requests", "429"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        return GatewayError::RateLimit {
            exchange,
            message: message.to_string(),
        };
    }

    if lowered.contains("insufficient") || lowered.contains("margin is insufficient") {
        return GatewayError::InsufficientBalance {
            exchange,
            message: message.to_string(),
        };
    }

    GatewayError::Exchange {
        exchange,
        message: message.to_string(),
    }
}

/// Keep diagnostics readable; exchange error bodies can be huge HTML pages.
fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_string()
    } else {
        format!("{}...", &body[..MAX])
    }
}
