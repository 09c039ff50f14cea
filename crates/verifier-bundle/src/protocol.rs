//! Remote Execution Protocol — request shapes and response classification.
//!
//! Two requests exist: a full-bundle execution carrying the base64 zip,
//! and a by-reference execution carrying only the verifier id. Responses
//! decode into a result value or a classified [`RemoteError`]. The client
//! never retries; recovery belongs to the delivery cache.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::bundle::Bundle;
use crate::config::ClientConfig;
use crate::definition::VerifierId;
use crate::error::RemoteError;

/// Error types the remote uses when it holds no function for an id.
const UNKNOWN_ERROR_TYPES: &[&str] = &["VerifierNotFound", "BundleNotFound"];
const UNKNOWN_MESSAGES: &[&str] = &["verifier not found", "bundle not found"];

/// Longest response body kept in a [`RemoteError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Positional and keyword arguments forwarded to the verifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }
}

/// Which of the two request shapes was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    FullBundle,
    ByReference,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FullBundle => write!(f, "full-bundle"),
            Self::ByReference => write!(f, "by-reference"),
        }
    }
}

/// One request against a remote target.
#[derive(Debug, Clone)]
pub enum ExecutionRequest {
    FullBundle {
        bundle: Arc<Bundle>,
        verifier_id: VerifierId,
        call: CallArgs,
    },
    ByReference {
        verifier_id: VerifierId,
        call: CallArgs,
    },
}

impl ExecutionRequest {
    pub fn full_bundle(bundle: Arc<Bundle>, call: CallArgs) -> Self {
        Self::FullBundle {
            verifier_id: bundle.verifier_id(),
            bundle,
            call,
        }
    }

    pub fn by_reference(verifier_id: VerifierId, call: CallArgs) -> Self {
        Self::ByReference { verifier_id, call }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Self::FullBundle { .. } => RequestKind::FullBundle,
            Self::ByReference { .. } => RequestKind::ByReference,
        }
    }

    pub fn verifier_id(&self) -> VerifierId {
        match self {
            Self::FullBundle { verifier_id, .. } | Self::ByReference { verifier_id, .. } => {
                *verifier_id
            }
        }
    }

    pub fn call(&self) -> &CallArgs {
        match self {
            Self::FullBundle { call, .. } | Self::ByReference { call, .. } => call,
        }
    }

    pub fn bundle(&self) -> Option<&Arc<Bundle>> {
        match self {
            Self::FullBundle { bundle, .. } => Some(bundle),
            Self::ByReference { .. } => None,
        }
    }
}

/// Transport seam for executing requests against one remote target.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<Value, RemoteError>;
}

/// JSON body of a request.
pub fn encode_request(request: &ExecutionRequest, timeout_secs: u64) -> Value {
    let call = request.call();
    match request {
        ExecutionRequest::FullBundle {
            bundle, verifier_id, ..
        } => json!({
            "bundle_data": BASE64.encode(bundle.archive()),
            "verifier_id": verifier_id.to_string(),
            "args": call.args,
            "kwargs": call.kwargs,
            "timeout": timeout_secs,
        }),
        ExecutionRequest::ByReference { verifier_id, .. } => json!({
            "verifier_id": verifier_id.to_string(),
            "args": call.args,
            "kwargs": call.kwargs,
            "timeout": timeout_secs,
        }),
    }
}

#[derive(Debug, Deserialize)]
struct VerificationResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<Value>,
}

/// Error object as reported by the remote.
#[derive(Debug, Default)]
struct RemoteErrorBody {
    error_type: Option<String>,
    message: Option<String>,
    traceback: Option<String>,
}

impl RemoteErrorBody {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(message) => Some(Self {
                message: Some(message.clone()),
                ..Self::default()
            }),
            Value::Object(fields) => {
                let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);
                Some(Self {
                    error_type: text("type"),
                    message: text("message").or_else(|| text("detail")),
                    traceback: text("traceback"),
                })
            }
            _ => None,
        }
    }

    fn from_body(body: &Value) -> Option<Self> {
        body.get("error")
            .and_then(Self::from_value)
            .or_else(|| body.get("detail").and_then(Self::from_value))
    }

    fn is_unknown_verifier(&self) -> bool {
        let type_matches = self
            .error_type
            .as_deref()
            .is_some_and(|t| UNKNOWN_ERROR_TYPES.contains(&t));
        let message_matches = self.message.as_deref().is_some_and(|m| {
            let lower = m.to_lowercase();
            UNKNOWN_MESSAGES.iter().any(|needle| lower.contains(needle))
        });
        type_matches || message_matches
    }
}

/// Classify an HTTP response for `request`.
pub fn decode_response(
    status: u16,
    body: &str,
    request: &ExecutionRequest,
) -> Result<Value, RemoteError> {
    let verifier_id = request.verifier_id().to_string();
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(RemoteErrorBody::from_body);

    if !(200..300).contains(&status) {
        let unknown = (status == 404 && request.kind() == RequestKind::ByReference)
            || error.as_ref().is_some_and(RemoteErrorBody::is_unknown_verifier);
        if unknown {
            return Err(RemoteError::UnknownVerifier {
                verifier_id,
                message: error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| format!("HTTP {status}")),
            });
        }
        return Err(RemoteError::Status {
            status,
            body: truncate(body, MAX_ERROR_BODY),
        });
    }

    let value = parsed.ok_or_else(|| {
        RemoteError::Decode(format!("body is not JSON: {}", truncate(body, 120)))
    })?;
    let response: VerificationResponse =
        serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))?;
    if response.success {
        return Ok(response.result);
    }

    let error = response
        .error
        .as_ref()
        .and_then(RemoteErrorBody::from_value)
        .unwrap_or_default();
    if error.is_unknown_verifier() {
        return Err(RemoteError::UnknownVerifier {
            verifier_id,
            message: error.message.unwrap_or_default(),
        });
    }
    Err(RemoteError::Execution {
        error_type: error.error_type.unwrap_or_else(|| "RuntimeError".to_string()),
        message: error
            .message
            .unwrap_or_else(|| "Remote execution failed".to_string()),
        traceback: error.traceback,
    })
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// HTTP implementation of [`RemoteExecutor`] on `reqwest`.
pub struct HttpRemoteClient {
    config: ClientConfig,
    base: String,
    client: reqwest::Client,
}

impl HttpRemoteClient {
    pub fn new(config: ClientConfig) -> Result<Self, RemoteError> {
        let base = config.base_url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base)
            .map_err(|e| RemoteError::InvalidAddress(format!("{base}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| RemoteError::Transmission(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            config,
            base,
            client,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn endpoint(&self, request: &ExecutionRequest) -> String {
        match request {
            ExecutionRequest::FullBundle { .. } => format!("{}/v1/verifiers/execute", self.base),
            ExecutionRequest::ByReference { verifier_id, .. } => {
                format!("{}/v1/verifiers/{verifier_id}/execute", self.base)
            }
        }
    }
}

#[async_trait]
impl RemoteExecutor for HttpRemoteClient {
    async fn execute(&self, request: &ExecutionRequest) -> Result<Value, RemoteError> {
        let url = self.endpoint(request);
        let body = encode_request(request, self.config.remote_timeout_secs);

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Transmission(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Transmission(e.to_string()))?;

        debug!(
            url = %url,
            kind = %request.kind(),
            status,
            bytes = text.len(),
            "Remote responded"
        );
        decode_response(status, &text, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_ref() -> ExecutionRequest {
        ExecutionRequest::by_reference(
            VerifierId::new(),
            CallArgs::new().arg(1).kwarg("mode", "strict"),
        )
    }

    #[test]
    fn test_encode_by_reference() {
        let request = by_ref();
        let body = encode_request(&request, 30);
        assert_eq!(body["verifier_id"], request.verifier_id().to_string());
        assert_eq!(body["args"], json!([1]));
        assert_eq!(body["kwargs"], json!({"mode": "strict"}));
        assert_eq!(body["timeout"], 30);
        assert!(body.get("bundle_data").is_none());
    }

    #[test]
    fn test_success_returns_result() {
        let value =
            decode_response(200, r#"{"success": true, "result": 0.75}"#, &by_ref()).unwrap();
        assert_eq!(value, json!(0.75));
    }

    #[test]
    fn test_404_on_by_reference_is_unknown() {
        let err = decode_response(404, r#"{"detail": "Not Found"}"#, &by_ref()).unwrap_err();
        assert!(err.is_unknown_verifier());
    }

    #[test]
    fn test_unknown_by_error_type_and_message() {
        let typed = r#"{"success": false, "error": {"type": "VerifierNotFound", "message": "no such id"}}"#;
        assert!(decode_response(200, typed, &by_ref()).unwrap_err().is_unknown_verifier());

        let message = r#"{"success": false, "error": {"type": "KeyError", "message": "Bundle not found for id"}}"#;
        assert!(decode_response(200, message, &by_ref()).unwrap_err().is_unknown_verifier());

        let status = r#"{"error": {"type": "BundleNotFound"}}"#;
        assert!(decode_response(410, status, &by_ref()).unwrap_err().is_unknown_verifier());
    }

    #[test]
    fn test_execution_error_passes_through() {
        let body = r#"{"success": false, "error": {"type": "ZeroDivisionError", "message": "division by zero", "traceback": "Traceback..."}}"#;
        match decode_response(200, body, &by_ref()).unwrap_err() {
            RemoteError::Execution {
                error_type,
                message,
                traceback,
            } => {
                assert_eq!(error_type, "ZeroDivisionError");
                assert_eq!(message, "division by zero");
                assert_eq!(traceback.as_deref(), Some("Traceback..."));
            }
            other => panic!("unexpected: {other}"),
        }

        match decode_response(200, r#"{"success": false}"#, &by_ref()).unwrap_err() {
            RemoteError::Execution { error_type, message, .. } => {
                assert_eq!(error_type, "RuntimeError");
                assert_eq!(message, "Remote execution failed");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_status_and_decode_errors() {
        let err = decode_response(502, "bad gateway", &by_ref()).unwrap_err();
        assert!(matches!(err, RemoteError::Status { status: 502, .. }));
        assert!(!err.is_acknowledged());

        let err = decode_response(200, "<html>", &by_ref()).unwrap_err();
        assert!(matches!(err, RemoteError::Decode(_)));
    }

    #[test]
    fn test_endpoints() {
        let client =
            HttpRemoteClient::new(ClientConfig::new("https://env.example.com/inst-1/")).unwrap();
        let request = by_ref();
        assert_eq!(
            client.endpoint(&request),
            format!("https://env.example.com/inst-1/v1/verifiers/{}/execute", request.verifier_id())
        );
        assert!(HttpRemoteClient::new(ClientConfig::new("not a url")).is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("ééé", 3), "é…");
    }
}
