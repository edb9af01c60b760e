//! SHA-256 signatures that make up the cloud and broker wire contracts
//!
//! None of these are keyed MACs. Each is a plain SHA-256 over an exact
//! concatenation, rendered as lower-case hex, and the byte layout must not
//! change or the cloud will reject the request.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Raw SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Lower-case hex SHA-256 of a UTF-8 string
pub fn sha256_lower_hex(data: &str) -> String {
    hex::encode(sha256(data.as_bytes()))
}

/// Signature for the token endpoint: `appKey || timestamp || appSecret`
pub fn access_token_signature(app_key: &str, timestamp_ms: &str, app_secret: &str) -> String {
    let mut input = String::with_capacity(app_key.len() + timestamp_ms.len() + app_secret.len());
    input.push_str(app_key);
    input.push_str(timestamp_ms);
    input.push_str(app_secret);
    sha256_lower_hex(&input)
}

/// Concatenate `key + value` pairs in ASCII key order
pub fn sorted_params(params: &BTreeMap<&str, String>) -> String {
    params.iter().fold(String::new(), |mut acc, (key, value)| {
        acc.push_str(key);
        acc.push_str(value);
        acc
    })
}

/// Signature for authenticated REST calls:
/// `accessToken || sortedParams || timestamp || accessSecret || body`
pub fn request_signature(
    access_token: &str,
    params: &BTreeMap<&str, String>,
    timestamp_ms: &str,
    access_secret: &str,
    body: &str,
) -> String {
    let mut input = String::from(access_token);
    input.push_str(&sorted_params(params));
    input.push_str(timestamp_ms);
    input.push_str(access_secret);
    input.push_str(body);
    sha256_lower_hex(&input)
}

/// MQTT CONNECT password; the field-name literals are part of the hashed input
pub fn mqtt_password(
    device_id: &str,
    product_key: &str,
    timestamp_ms: &str,
    device_secret: &str,
) -> String {
    let input = format!(
        "clientId{device_id}deviceKey{device_id}productKey{product_key}timestamp{timestamp_ms}{device_secret}"
    );
    sha256_lower_hex(&input)
}
