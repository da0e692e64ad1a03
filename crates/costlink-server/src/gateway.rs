use std::time::Duration;

use costlink_config::Erp;
use reqwest::{Client, Method, Url};
use serde_json::Value;

pub const TRANSPORT_FAILURE: u16 = 0;
pub const STATUS_ALREADY_EXISTS: u16 = 412;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTimeout {
    Data,
    Lookup,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiBody {
    Json(Value),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: ApiBody,
}

impl ApiResponse {
    fn transport_failure(message: String) -> Self {
        Self {
            status: TRANSPORT_FAILURE,
            body: ApiBody::Text(message),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn already_exists(&self) -> bool {
        self.status == STATUS_ALREADY_EXISTS
    }

    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            ApiBody::Json(v) => Some(v),
            ApiBody::Text(_) => None,
        }
    }

    pub fn rows(&self) -> &[Value] {
        self.json()
            .and_then(|v| v.get("rows"))
            .and_then(|v| v.as_array())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn error_message(&self) -> String {
        let text = match &self.body {
            ApiBody::Json(v) => v
                .get("errors")
                .and_then(|e| e.get(0))
                .and_then(|e| e.get("error"))
                .and_then(|e| e.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| v.to_string()),
            ApiBody::Text(t) => t.clone(),
        };
        let text: String = text.chars().take(300).collect();
        if self.status == TRANSPORT_FAILURE {
            format!("transport error: {text}")
        } else {
            format!("HTTP {}: {text}", self.status)
        }
    }
}

pub struct Gateway {
    client: Client,
    base_url: String,
    data_timeout: Duration,
    lookup_timeout: Duration,
}

impl Gateway {
    pub fn new(cfg: &Erp) -> Result<Self, String> {
        let client = Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            data_timeout: Duration::from_millis(cfg.data_timeout_ms),
            lookup_timeout: Duration::from_millis(cfg.lookup_timeout_ms),
        })
    }

    pub async fn call(
        &self,
        method: Method,
        path: &str,
        credential: &str,
        body: Option<&Value>,
        timeout: CallTimeout,
    ) -> ApiResponse {
        self.call_with_query(method, path, &[], credential, body, timeout)
            .await
    }

    /// `path` is relative to the ERP base URL unless it is already absolute.
    pub async fn call_with_query(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        credential: &str,
        body: Option<&Value>,
        timeout: CallTimeout,
    ) -> ApiResponse {
        let url = match self.url(path, query) {
            Ok(v) => v,
            Err(e) => return ApiResponse::transport_failure(e),
        };
        let timeout = match timeout {
            CallTimeout::Data => self.data_timeout,
            CallTimeout::Lookup => self.lookup_timeout,
        };

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .bearer_auth(credential)
            .timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%method, path = url.path(), error = %e, "erp call failed");
                return ApiResponse::transport_failure(e.to_string());
            }
        };
        let status = response.status().as_u16();
        let text = match response.text().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%method, path = url.path(), status, error = %e, "erp response body unreadable");
                return ApiResponse {
                    status,
                    body: ApiBody::Text(e.to_string()),
                };
            }
        };
        tracing::debug!(%method, path = url.path(), status, "erp call");

        let body = match serde_json::from_str::<Value>(&text) {
            Ok(v) => ApiBody::Json(v),
            Err(_) => ApiBody::Text(text),
        };
        ApiResponse { status, body }
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, String> {
        let raw = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        };
        let mut url = Url::parse(&raw).map_err(|e| format!("invalid url {raw}: {e}"))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gateway(base: &str) -> Gateway {
        Gateway::new(&Erp {
            base_url: base.to_string(),
            data_timeout_ms: 1000,
            lookup_timeout_ms: 500,
        })
        .unwrap()
    }

    #[test]
    fn joins_relative_paths_and_encodes_query() {
        let gw = gateway("https://erp.example/api/remap/1.2/");
        let url = gw
            .url(
                "/entity/demand",
                &[("filter", "name=ДГ-1;moment>=2025-01-01 00:00:00".to_string())],
            )
            .unwrap();
        assert_eq!(url.path(), "/api/remap/1.2/entity/demand");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![(
                "filter".to_string(),
                "name=ДГ-1;moment>=2025-01-01 00:00:00".to_string()
            )]
        );
    }

    #[test]
    fn absolute_paths_bypass_base_url() {
        let gw = gateway("https://erp.example/api");
        let url = gw.url("https://vendor.example/context/abc", &[]).unwrap();
        assert_eq!(url.host_str(), Some("vendor.example"));
    }

    #[test]
    fn error_message_prefers_erp_error_text() {
        let resp = ApiResponse {
            status: 412,
            body: ApiBody::Json(json!({"errors": [{"error": "already exists", "code": 3006}]})),
        };
        assert!(resp.already_exists());
        assert_eq!(resp.error_message(), "HTTP 412: already exists");

        let resp = ApiResponse::transport_failure("timed out".to_string());
        assert!(!resp.is_success());
        assert_eq!(resp.error_message(), "transport error: timed out");
    }

    #[tokio::test]
    async fn unreachable_host_yields_status_zero() {
        let gw = gateway("http://127.0.0.1:9");
        let resp = gw
            .call(Method::GET, "entity/demand", "tok", None, CallTimeout::Lookup)
            .await;
        assert_eq!(resp.status, TRANSPORT_FAILURE);
        assert!(matches!(resp.body, ApiBody::Text(_)));
    }
}
