// ─────────────────────────────────────────────────────────────────────────────
// exchange.rs — Bitget REST transport
//
// Every response is wrapped as {code, msg, data} with code "00000" on
// success. Any other code is surfaced as EngineError::Business with the
// original code preserved. HTTP 429 / 401 / 403 are classified before the
// envelope is even parsed. Papertrading is selected with a single request
// header; paths and product types are identical in both environments.
// ─────────────────────────────────────────────────────────────────────────────
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::signing::{sign_request, ApiCredentials};

const DEFAULT_BASE_URL: &str = "https://api.bitget.com";
const REQUEST_TIMEOUT_SECS: u64 = 10;
const SUCCESS_CODE: &str = "00000";

pub struct BitgetClient {
    http: reqwest::Client,
    base_url: String,
    credentials: ApiCredentials,
    /// When true, every request carries the `paptrading: 1` header and hits
    /// the sandbox matching engine.
    simulated: bool,
}

impl BitgetClient {
    pub fn new(credentials: ApiCredentials, base_url: Option<String>, simulated: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            credentials,
            simulated,
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    /// Unsigned GET for public market/instrument endpoints.
    pub async fn get_public(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let path_q = join_query(path, query);
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path_q))
            .send()
            .await?;
        self.unwrap_envelope(resp).await
    }

    /// Signed GET for private endpoints.
    pub async fn get_signed(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let path_q = join_query(path, query);
        let ts = chrono::Utc::now().timestamp_millis();
        let sig = sign_request(&self.credentials.secret_key, ts, "GET", &path_q, "");
        let req = self
            .http
            .get(format!("{}{}", self.base_url, path_q))
            .header("ACCESS-KEY", &self.credentials.api_key)
            .header("ACCESS-SIGN", sig)
            .header("ACCESS-TIMESTAMP", ts.to_string())
            .header("ACCESS-PASSPHRASE", &self.credentials.passphrase)
            .header("locale", "en-US");
        let req = if self.simulated { req.header("paptrading", "1") } else { req };
        self.unwrap_envelope(req.send().await?).await
    }

    /// Signed POST with a JSON body.
    pub async fn post_signed(&self, path: &str, body: &Value) -> Result<Value> {
        let body_str = serde_json::to_string(body)
            .map_err(|e| EngineError::Transport(format!("body serialization: {}", e)))?;
        let ts = chrono::Utc::now().timestamp_millis();
        let sig = sign_request(&self.credentials.secret_key, ts, "POST", path, &body_str);
        let req = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("ACCESS-KEY", &self.credentials.api_key)
            .header("ACCESS-SIGN", sig)
            .header("ACCESS-TIMESTAMP", ts.to_string())
            .header("ACCESS-PASSPHRASE", &self.credentials.passphrase)
            .header("Content-Type", "application/json")
            .header("locale", "en-US")
            .body(body_str);
        let req = if self.simulated { req.header("paptrading", "1") } else { req };
        self.unwrap_envelope(req.send().await?).await
    }

    async fn unwrap_envelope(&self, resp: reqwest::Response) -> Result<Value> {
        let status = resp.status().as_u16();
        match status {
            429 => return Err(EngineError::RateLimited),
            401 | 403 => return Err(EngineError::Auth(status)),
            _ => {}
        }
        let text = resp.text().await?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| EngineError::Transport(format!("bad response body (http {}): {}", status, e)))?;
        unwrap_response(value)
    }
}

/// Splits the `{code, msg, data}` envelope, preserving non-success codes.
pub fn unwrap_response(value: Value) -> Result<Value> {
    let code = value["code"].as_str().unwrap_or_default().to_string();
    if code == SUCCESS_CODE {
        Ok(value.get("data").cloned().unwrap_or(Value::Null))
    } else {
        let msg = value["msg"].as_str().unwrap_or("unknown exchange error").to_string();
        Err(EngineError::Business { code, msg })
    }
}

fn join_query(path: &str, query: &[(&str, String)]) -> String {
    if query.is_empty() {
        return path.to_string();
    }
    let qs: Vec<String> = query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}?{}", path, qs.join("&"))
}

/// Bitget sends most numbers as strings; tolerate both.
pub fn field_f64(value: &Value, key: &str) -> Option<f64> {
    let v = &value[key];
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

pub fn field_i64(value: &Value, key: &str) -> Option<i64> {
    let v = &value[key];
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_success_envelope() {
        let data = unwrap_response(json!({
            "code": "00000", "msg": "success", "data": {"last": "70000.5"}
        }))
        .unwrap();
        assert_eq!(data["last"], "70000.5");
    }

    #[test]
    fn test_unwrap_business_error_preserves_code() {
        let err = unwrap_response(json!({
            "code": "22002", "msg": "No position to close", "data": null
        }))
        .unwrap_err();
        assert_eq!(err.business_code(), Some("22002"));
    }

    #[test]
    fn test_join_query() {
        assert_eq!(join_query("/api/v2/mix/market/ticker", &[]), "/api/v2/mix/market/ticker");
        assert_eq!(
            join_query(
                "/api/v2/mix/market/ticker",
                &[("symbol", "BTCUSDT".into()), ("productType", "USDT-FUTURES".into())]
            ),
            "/api/v2/mix/market/ticker?symbol=BTCUSDT&productType=USDT-FUTURES"
        );
    }

    #[test]
    fn test_field_f64_accepts_string_and_number() {
        let row = json!({"a": "1.5", "b": 2.5, "c": "nope"});
        assert_eq!(field_f64(&row, "a"), Some(1.5));
        assert_eq!(field_f64(&row, "b"), Some(2.5));
        assert_eq!(field_f64(&row, "c"), None);
        assert_eq!(field_f64(&row, "missing"), None);
    }
}
