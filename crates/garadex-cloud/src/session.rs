//! Authenticated cloud account session.
//!
//! Wraps the vendor HTTP API: login, device directory, and sub-device
//! lookup for hubs. The session owns the account credentials returned
//! by login; the MQTT transport derives its broker credentials from
//! them.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::{CloudError, CloudResult};
use crate::sign::{encode_params, nonce, signature, NONCE_LEN};

const DEFAULT_BASE_URL: &str = "https://iot.meross.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSIENT_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// The exact rejection string the server uses for bad credentials.
/// Triggers the one-time base64 password fallback.
const CREDENTIAL_MISMATCH: &str = "Username is not exist or password is wrong";

/// Account credentials returned by a successful login.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Account signing key, also used for MQTT broker passwords.
    pub key: String,
    /// Bearer token for authenticated HTTP endpoints.
    pub token: String,
    /// Numeric account id, used as the MQTT username and topic segment.
    pub user_id: String,
}

/// One device as listed by the account directory.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRecord {
    pub uuid: String,
    #[serde(rename = "devName", default)]
    pub dev_name: String,
    #[serde(rename = "deviceType", default)]
    pub device_type: String,
    /// 1 means reachable through the cloud broker.
    #[serde(rename = "onlineStatus", default)]
    pub online_status: i64,
    /// Broker hostname assigned to this device, when present.
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub channels: Vec<JsonValue>,
}

impl DeviceRecord {
    pub fn is_online(&self) -> bool {
        self.online_status == 1
    }
}

/// One sub-device behind a hub.
#[derive(Debug, Clone, Deserialize)]
pub struct SubDeviceRecord {
    #[serde(rename = "subDeviceId")]
    pub sub_device_id: String,
    #[serde(rename = "subDeviceType", default)]
    pub sub_device_type: Option<String>,
    #[serde(rename = "subDeviceName", default)]
    pub sub_device_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    info: Option<String>,
    #[serde(default)]
    data: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    key: String,
    token: String,
    #[serde(rename = "userid", deserialize_with = "string_or_number")]
    user_id: String,
}

/// The server has returned `userid` as both a JSON string and a JSON
/// number across API revisions.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    match value {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// HTTP session against the vendor cloud.
///
/// Create one per account, call [`login`](Self::login) once, then use
/// the directory endpoints. Transient network faults are retried with a
/// fixed backoff; credential rejections fail fast after the one base64
/// fallback attempt.
pub struct CloudSession {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    credentials: Option<Credentials>,
    base64_tried: bool,
    retry_backoff: Duration,
}

impl CloudSession {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> CloudResult<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            username: username.into(),
            password: password.into(),
            credentials: None,
            base64_tried: false,
            retry_backoff: TRANSIENT_RETRY_BACKOFF,
        })
    }

    /// Point the session at a different API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Shorten the transient-fault backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Credentials from the last successful login, if any.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Authenticate against the account API.
    ///
    /// If the server reports a credential mismatch and the configured
    /// password decodes as base64, one retry is made with the decoded
    /// password. Some setups store the password pre-encoded; the
    /// fallback runs at most once per session.
    pub async fn login(&mut self) -> CloudResult<Credentials> {
        loop {
            match self.try_login().await {
                Ok(creds) => {
                    debug!(user_id = %creds.user_id, "cloud login succeeded");
                    self.credentials = Some(creds.clone());
                    return Ok(creds);
                }
                Err(CloudError::TransientNetwork(reason)) => {
                    warn!(%reason, backoff = ?self.retry_backoff, "cloud login failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(CloudError::Authentication(info)) => {
                    if !self.base64_fallback(&info) {
                        return Err(CloudError::Authentication(info));
                    }
                    warn!("credentials rejected, retrying with base64-decoded password");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Decide whether a rejected login warrants one more attempt with the
    /// base64-decoded password. Swaps the password in when it does. Runs
    /// at most once per session regardless of outcome.
    fn base64_fallback(&mut self, info: &str) -> bool {
        if info != CREDENTIAL_MISMATCH || self.base64_tried {
            return false;
        }
        self.base64_tried = true;
        match decode_base64_password(&self.password) {
            Some(decoded) => {
                self.password = decoded;
                true
            }
            None => false,
        }
    }

    async fn try_login(&self) -> CloudResult<Credentials> {
        let params = serde_json::json!({
            "email": self.username,
            "password": self.password,
        });
        let response = self.post("/v1/Auth/Login", &params, None).await?;

        let info = response.info.unwrap_or_default();
        if info != "Success" {
            return Err(CloudError::Authentication(if info.is_empty() {
                "login rejected without a reason".to_string()
            } else {
                info
            }));
        }
        let Some(data) = response.data else {
            return Err(CloudError::MalformedResponse(
                "login reply is missing its data section".to_string(),
            ));
        };
        let login: LoginData = serde_json::from_value(data)
            .map_err(|e| CloudError::MalformedResponse(format!("login data: {e}")))?;
        Ok(Credentials {
            key: login.key,
            token: login.token,
            user_id: login.user_id,
        })
    }

    /// List the devices registered to the account.
    pub async fn list_devices(&self) -> CloudResult<Vec<DeviceRecord>> {
        let creds = self.credentials.as_ref().ok_or(CloudError::NotAuthenticated)?;
        loop {
            match self
                .post("/v1/Device/devList", &serde_json::json!({}), Some(&creds.token))
                .await
            {
                Ok(response) => return parse_record_list(response, "device list"),
                Err(CloudError::TransientNetwork(reason)) => {
                    warn!(%reason, backoff = ?self.retry_backoff, "device list failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// List the sub-devices behind a hub device.
    pub async fn list_sub_devices(&self, hub_uuid: &str) -> CloudResult<Vec<SubDeviceRecord>> {
        let creds = self.credentials.as_ref().ok_or(CloudError::NotAuthenticated)?;
        let params = serde_json::json!({ "uuid": hub_uuid });
        loop {
            match self
                .post("/v1/Hub/getSubDevices", &params, Some(&creds.token))
                .await
            {
                Ok(response) => return parse_record_list(response, "sub-device list"),
                Err(CloudError::TransientNetwork(reason)) => {
                    warn!(%reason, backoff = ?self.retry_backoff, "sub-device list failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Send one signed request. `token` is required for every endpoint
    /// except login.
    async fn post(
        &self,
        path: &str,
        params: &JsonValue,
        token: Option<&str>,
    ) -> CloudResult<ApiResponse> {
        let encoded = encode_params(params);
        let timestamp = chrono::Utc::now().timestamp_millis();
        let nonce = nonce(NONCE_LEN);
        let sign = signature(timestamp, &nonce, &encoded);

        let body = serde_json::json!({
            "params": encoded,
            "sign": sign,
            "timestamp": timestamp,
            "nonce": nonce,
        });

        let authorization = match token {
            Some(token) => format!("Basic {token}"),
            None => "Basic ".to_string(),
        };

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", authorization)
            .header("vender", "Meross")
            .header("AppVersion", "1.3.0")
            .header("AppLanguage", "EN")
            .header("User-Agent", "okhttp/3.6.0")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| CloudError::MalformedResponse(e.to_string()))?;
        Ok(parsed)
    }
}

fn classify_transport_error(err: reqwest::Error) -> CloudError {
    if err.is_timeout() || err.is_connect() {
        CloudError::TransientNetwork(err.to_string())
    } else {
        CloudError::Http(err)
    }
}

/// Parse a `Success`-wrapped JSON array of records. Anything else is a
/// malformed response, distinct from a transport failure.
fn parse_record_list<T: serde::de::DeserializeOwned>(
    response: ApiResponse,
    what: &str,
) -> CloudResult<Vec<T>> {
    if response.info.as_deref() != Some("Success") {
        return Err(CloudError::MalformedResponse(format!(
            "{what} request rejected: {}",
            response.info.unwrap_or_else(|| "no reason given".to_string())
        )));
    }
    let Some(JsonValue::Array(items)) = response.data else {
        return Err(CloudError::MalformedResponse(format!(
            "{what} reply is not an array"
        )));
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|e| CloudError::MalformedResponse(format!("{what} entry: {e}")))
        })
        .collect()
}

/// Decode a base64-stored password, stripping line breaks and padding
/// whitespace. Returns `None` when the input is not valid base64 text.
fn decode_base64_password(password: &str) -> Option<String> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let bytes = BASE64.decode(password.trim()).ok()?;
    let decoded = String::from_utf8(bytes).ok()?;
    let cleaned: String = decoded.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_password() {
        // "hunter2" with a trailing newline inside the encoded text.
        assert_eq!(
            decode_base64_password("aHVudGVyMgo=").as_deref(),
            Some("hunter2")
        );
        assert_eq!(decode_base64_password("not!base64"), None);
        assert_eq!(decode_base64_password(""), None);
    }

    #[test]
    fn test_login_data_accepts_string_or_numeric_user_id() {
        let numeric = serde_json::json!({ "key": "k", "token": "t", "userid": 482915 });
        let login: LoginData = serde_json::from_value(numeric).unwrap();
        assert_eq!(login.user_id, "482915");

        let text = serde_json::json!({ "key": "k", "token": "t", "userid": "482915" });
        let login: LoginData = serde_json::from_value(text).unwrap();
        assert_eq!(login.user_id, "482915");
    }

    #[test]
    fn test_base64_fallback_runs_exactly_once() {
        // "hunter2" base64-encoded.
        let mut session = CloudSession::new("user@example.com", "aHVudGVyMg==").unwrap();
        assert!(session.base64_fallback(CREDENTIAL_MISMATCH));
        assert_eq!(session.password, "hunter2");

        // A second rejection fails fast instead of looping.
        assert!(!session.base64_fallback(CREDENTIAL_MISMATCH));
        assert_eq!(session.password, "hunter2");
    }

    #[test]
    fn test_base64_fallback_ignores_other_rejections() {
        let mut session = CloudSession::new("user@example.com", "aHVudGVyMg==").unwrap();
        assert!(!session.base64_fallback("Token expired"));
        assert!(!session.base64_tried);
    }

    #[test]
    fn test_base64_fallback_requires_decodable_password() {
        let mut session = CloudSession::new("user@example.com", "plain!password").unwrap();
        assert!(!session.base64_fallback(CREDENTIAL_MISMATCH));
    }

    #[test]
    fn test_parse_device_list() {
        let response = ApiResponse {
            info: Some("Success".to_string()),
            data: Some(serde_json::json!([
                {
                    "uuid": "2109349c8573nb20",
                    "devName": "Garage",
                    "deviceType": "msg100",
                    "onlineStatus": 1,
                    "domain": "mqtt-eu.example.net",
                    "channels": [{}]
                }
            ])),
        };
        let devices: Vec<DeviceRecord> = parse_record_list(response, "device list").unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_type, "msg100");
        assert!(devices[0].is_online());
    }

    #[test]
    fn test_parse_device_list_rejects_non_array() {
        let response = ApiResponse {
            info: Some("Success".to_string()),
            data: Some(serde_json::json!({"unexpected": true})),
        };
        let result: CloudResult<Vec<DeviceRecord>> = parse_record_list(response, "device list");
        assert!(matches!(result, Err(CloudError::MalformedResponse(_))));
    }

    #[test]
    fn test_parse_device_list_rejects_failure_info() {
        let response = ApiResponse {
            info: Some("Token expired".to_string()),
            data: None,
        };
        let result: CloudResult<Vec<DeviceRecord>> = parse_record_list(response, "device list");
        assert!(matches!(result, Err(CloudError::MalformedResponse(_))));
    }
}
