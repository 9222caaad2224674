//! Signed-request authentication for the REST layer.
//!
//! Binance-style: the client sends its api key in `X-MBX-APIKEY` and signs
//! the query string (minus the `signature` parameter) with HMAC-SHA256,
//! appending the hex digest as `signature`. A `timestamp` parameter must be
//! within the configured skew of server time.
//!
//! In this virtual exchange the api key doubles as the HMAC secret — there is
//! no separate secret distribution channel.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

use crate::account::AccountManager;
use crate::error::{ExchangeError, ExchangeResult};

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "X-MBX-APIKEY";

/// Outcome of verifying a signed request.
#[derive(Clone, Debug)]
pub struct AuthedRequest {
    pub user_id: String,
    pub params: HashMap<String, String>,
}

/// Compute the hex HMAC-SHA256 signature of `payload` under `secret`. Also
/// used by clients (and tests) to build signed requests.
pub fn sign(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Split a raw query string into ordered key/value pairs. No URL decoding:
/// the API surface only carries symbols, numbers, and hex.
fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

/// The signing payload: the raw query with the `signature` parameter removed.
fn signing_payload(raw: &str) -> String {
    raw.split('&')
        .filter(|part| !part.is_empty() && !part.starts_with("signature="))
        .collect::<Vec<_>>()
        .join("&")
}

/// Verify api key, timestamp skew, and signature of a signed endpoint call.
pub fn verify_signed(
    accounts: &AccountManager,
    api_key: Option<&str>,
    raw_query: &str,
    now_ms: i64,
    skew_ms: i64,
) -> ExchangeResult<AuthedRequest> {
    let api_key = match api_key {
        Some(k) if !k.is_empty() => k,
        _ => return Err(ExchangeError::InvalidApiKey),
    };
    let user_id = accounts
        .resolve_api_key(api_key)
        .ok_or(ExchangeError::InvalidApiKey)?;

    let pairs = parse_query(raw_query);
    let params: HashMap<String, String> = pairs.iter().cloned().collect();

    let timestamp: i64 = params
        .get("timestamp")
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| ExchangeError::InvalidParam("timestamp is required".into()))?;
    if (now_ms - timestamp).abs() > skew_ms {
        return Err(ExchangeError::InvalidTimestamp);
    }

    let signature = params
        .get("signature")
        .ok_or_else(|| ExchangeError::InvalidParam("signature is required".into()))?;
    let expected = sign(api_key, &signing_payload(raw_query));
    if !constant_time_eq(signature, &expected) {
        return Err(ExchangeError::InvalidSignature);
    }

    Ok(AuthedRequest { user_id, params })
}

/// Resolve the api key on endpoints that authenticate without signing
/// (listen-key management).
pub fn verify_api_key(
    accounts: &AccountManager,
    api_key: Option<&str>,
) -> ExchangeResult<String> {
    let api_key = match api_key {
        Some(k) if !k.is_empty() => k,
        _ => return Err(ExchangeError::InvalidApiKey),
    };
    accounts
        .resolve_api_key(api_key)
        .ok_or(ExchangeError::InvalidApiKey)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn accounts_with_user() -> (AccountManager, String) {
        let accounts = AccountManager::new(dec!(0.001), dec!(0.001));
        let key = accounts.register_user("u1").unwrap();
        (accounts, key)
    }

    fn signed_query(key: &str, base: &str) -> String {
        format!("{base}&signature={}", sign(key, base))
    }

    #[test]
    fn valid_signature_resolves_user() {
        let (accounts, key) = accounts_with_user();
        let query = signed_query(&key, "symbol=BTCUSDT&timestamp=1000");
        let authed = verify_signed(&accounts, Some(&key), &query, 1000, 10_000).unwrap();
        assert_eq!(authed.user_id, "u1");
        assert_eq!(authed.params.get("symbol").unwrap(), "BTCUSDT");
    }

    #[test]
    fn missing_or_unknown_api_key() {
        let (accounts, key) = accounts_with_user();
        let query = signed_query(&key, "timestamp=1000");
        assert_eq!(
            verify_signed(&accounts, None, &query, 1000, 10_000).unwrap_err(),
            ExchangeError::InvalidApiKey
        );
        assert_eq!(
            verify_signed(&accounts, Some("bogus"), &query, 1000, 10_000).unwrap_err(),
            ExchangeError::InvalidApiKey
        );
    }

    #[test]
    fn tampered_query_fails_signature() {
        let (accounts, key) = accounts_with_user();
        let query = signed_query(&key, "symbol=BTCUSDT&timestamp=1000");
        let tampered = query.replace("BTCUSDT", "ETHUSDT");
        assert_eq!(
            verify_signed(&accounts, Some(&key), &tampered, 1000, 10_000).unwrap_err(),
            ExchangeError::InvalidSignature
        );
    }

    #[test]
    fn stale_timestamp_rejected() {
        let (accounts, key) = accounts_with_user();
        let query = signed_query(&key, "timestamp=1000");
        assert_eq!(
            verify_signed(&accounts, Some(&key), &query, 100_000, 10_000).unwrap_err(),
            ExchangeError::InvalidTimestamp
        );
        // Inside the skew window passes.
        assert!(verify_signed(&accounts, Some(&key), &query, 10_500, 10_000).is_ok());
    }

    #[test]
    fn signature_position_does_not_matter_for_payload() {
        let (_, key) = accounts_with_user();
        assert_eq!(
            signing_payload("a=1&signature=xyz&b=2"),
            "a=1&b=2".to_string()
        );
        let _ = key;
    }
}
