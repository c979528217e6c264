// NODE RPC PROBE
//
// SAFETY INVARIANTS:
// 1. Every request carries a timeout
// 2. Probes are read-only: health and info endpoints only
// 3. A JSON-RPC error object is an error, never a default value

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ProbeError;

/// Read-only view of a running node over its HTTP API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeProbe: Send + Sync {
    /// Overall health as reported by `health.health`
    async fn healthy(&self) -> Result<bool, ProbeError>;

    /// Whether `chain` (P, X or C) has finished bootstrapping
    async fn is_bootstrapped(&self, chain: &str) -> Result<bool, ProbeError>;

    async fn node_version(&self) -> Result<String, ProbeError>;

    async fn node_id(&self) -> Result<String, ProbeError>;
}

/// JSON-RPC 2.0 client for AvalancheGo's `/ext/info` and `/ext/health`
pub struct RpcProbe {
    client: reqwest::Client,
    base: String,
}

impl RpcProbe {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(RpcProbe {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    /// Probe for a node listening on loopback at `port`
    pub fn local(port: u16, timeout: Duration) -> Result<Self, ProbeError> {
        Self::new(format!("http://127.0.0.1:{}", port), timeout)
    }

    async fn call(&self, endpoint: &str, method: &str) -> Result<Value, ProbeError> {
        self.call_with(endpoint, method, json!({})).await
    }

    async fn call_with(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, ProbeError> {
        let url = format!("{}{}", self.base, endpoint);
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        debug!("RPC {} {}", url, method);
        let response: Value = self.client.post(&url).json(&body).send().await?.json().await?;
        extract_result(response)
    }
}

/// Pull `result` out of a JSON-RPC response, surfacing `error` objects.
pub fn extract_result(response: Value) -> Result<Value, ProbeError> {
    if let Some(error) = response.get("error") {
        return Err(ProbeError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match response {
        Value::Object(mut map) => map
            .remove("result")
            .ok_or_else(|| ProbeError::Malformed("response has neither result nor error".to_string())),
        other => Err(ProbeError::Malformed(format!("expected an object, got {}", other))),
    }
}

fn field<'a>(result: &'a Value, name: &str) -> Result<&'a Value, ProbeError> {
    result
        .get(name)
        .ok_or_else(|| ProbeError::Malformed(format!("result lacks `{}`", name)))
}

fn bool_field(result: &Value, name: &str) -> Result<bool, ProbeError> {
    field(result, name)?
        .as_bool()
        .ok_or_else(|| ProbeError::Malformed(format!("`{}` is not a boolean", name)))
}

fn string_field(result: &Value, name: &str) -> Result<String, ProbeError> {
    field(result, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProbeError::Malformed(format!("`{}` is not a string", name)))
}

#[async_trait]
impl NodeProbe for RpcProbe {
    async fn healthy(&self) -> Result<bool, ProbeError> {
        let result = self.call("/ext/health", "health.health").await?;
        bool_field(&result, "healthy")
    }

    async fn is_bootstrapped(&self, chain: &str) -> Result<bool, ProbeError> {
        let result = self
            .call_with("/ext/info", "info.isBootstrapped", json!({ "chain": chain }))
            .await?;
        bool_field(&result, "isBootstrapped")
    }

    async fn node_version(&self) -> Result<String, ProbeError> {
        let result = self.call("/ext/info", "info.getNodeVersion").await?;
        string_field(&result, "version")
    }

    async fn node_id(&self) -> Result<String, ProbeError> {
        let result = self.call("/ext/info", "info.getNodeID").await?;
        string_field(&result, "nodeID")
    }
}

/// Poll until the node answers `info.getNodeVersion`, or `timeout` passes.
/// Returns the reported version, or the last error.
pub async fn wait_for_rpc(
    probe: &dyn NodeProbe,
    timeout: Duration,
    poll: Duration,
) -> Result<String, ProbeError> {
    let started = Instant::now();
    loop {
        match probe.node_version().await {
            Ok(version) => {
                debug!("Node answered RPC after {:?}", started.elapsed());
                return Ok(version);
            }
            Err(e) if started.elapsed() >= timeout => return Err(e),
            Err(e) => {
                debug!("Node RPC not ready: {}", e);
                tokio::time::sleep(poll).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_extract_result() {
        let ok = json!({"jsonrpc": "2.0", "id": 1, "result": {"version": "avalanchego/1.11.3"}});
        let result = extract_result(ok).unwrap();
        assert_eq!(string_field(&result, "version").unwrap(), "avalanchego/1.11.3");

        let err = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "method not found"}});
        match extract_result(err) {
            Err(ProbeError::Rpc { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method not found");
            }
            other => panic!("expected RPC error, got {:?}", other),
        }

        assert!(matches!(
            extract_result(json!({"jsonrpc": "2.0", "id": 1})),
            Err(ProbeError::Malformed(_))
        ));
        assert!(matches!(extract_result(json!([1, 2])), Err(ProbeError::Malformed(_))));
    }

    #[test]
    fn test_typed_fields() {
        let result = json!({"healthy": true, "nodeID": 7});
        assert!(bool_field(&result, "healthy").unwrap());
        assert!(string_field(&result, "nodeID").is_err());
        assert!(bool_field(&result, "missing").is_err());
    }

    #[tokio::test]
    async fn test_wait_for_rpc_retries_until_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut probe = MockNodeProbe::new();
        probe.expect_node_version().returning(move || {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProbeError::Malformed("connection refused".to_string()))
            } else {
                Ok("avalanchego/1.11.3".to_string())
            }
        });

        let version = wait_for_rpc(&probe, Duration::from_secs(5), Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(version, "avalanchego/1.11.3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_for_rpc_gives_up() {
        let mut probe = MockNodeProbe::new();
        probe
            .expect_node_version()
            .returning(|| Err(ProbeError::Malformed("connection refused".to_string())));
        let err = wait_for_rpc(&probe, Duration::from_millis(20), Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_unreachable_node_is_an_error() {
        // nothing listens on port 9 of loopback in a test environment
        let probe = RpcProbe::local(9, Duration::from_millis(500)).unwrap();
        assert!(matches!(probe.node_version().await, Err(ProbeError::Http(_))));
    }
}
