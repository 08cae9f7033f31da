//! Request signing for the cloud HTTP API.
//!
//! Every request body carries a base64 `params` blob plus an md5
//! signature over a fixed app secret, the millisecond timestamp, a
//! random nonce and the encoded params. The secret is baked into the
//! vendor app and is the same for every account.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// App-level signing secret shared by all clients of the vendor API.
pub(crate) const SIGNING_SECRET: &str = "23x17ahWarFH6w29";

/// Length of the random nonce attached to each request.
pub(crate) const NONCE_LEN: usize = 16;

/// Random alphanumeric nonce.
pub fn nonce(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Base64-encode a JSON parameter object into the `params` field.
pub fn encode_params(params: &serde_json::Value) -> String {
    BASE64.encode(params.to_string())
}

/// md5 hex digest of `secret + timestamp + nonce + params`.
pub fn signature(timestamp_millis: i64, nonce: &str, params: &str) -> String {
    let data = format!("{SIGNING_SECRET}{timestamp_millis}{nonce}{params}");
    format!("{:x}", md5::compute(data.as_bytes()))
}
