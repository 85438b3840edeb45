//! Line-delimited JSON-RPC framing and response correlation

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{LifecycleError, Result};

/// JSON-RPC version written on every frame
pub const JSONRPC_VERSION: &str = "2.0";
/// Protocol revision announced during the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";
/// Handshake request
pub const INITIALIZE_METHOD: &str = "initialize";
/// Notification sent after a successful handshake
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";
/// Operation-listing request
pub const DISCOVERY_METHOD: &str = "tools/list";
/// Health probe request
pub const PING_METHOD: &str = "ping";

/// Read one newline-terminated line, replacing invalid UTF-8.
///
/// Returns `None` at end of stream. `buf` is scratch space reused between calls.
pub async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Outbound request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: serde_json::Value,
}

/// Outbound notification frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
}

/// Error object of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Inbound frame. Server notifications carry a method and no id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl Response {
    /// Convert into the call outcome
    pub fn into_result(self) -> Result<serde_json::Value> {
        match self.error {
            Some(error) => Err(LifecycleError::RpcError {
                code: error.code,
                message: error.message,
            }),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// Serialize a request as one newline-terminated unit
pub fn encode_request(id: u64, method: &str, params: serde_json::Value) -> Result<String> {
    let request = Request {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        method: method.to_string(),
        params,
    };
    frame(&request)
}

/// Serialize a notification as one newline-terminated unit
pub fn encode_notification(method: &str, params: serde_json::Value) -> Result<String> {
    let notification = Notification {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: method.to_string(),
        params,
    };
    frame(&notification)
}

fn frame<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| LifecycleError::ProtocolError(format!("JSON error: {}", e)))?;
    line.push('\n');
    Ok(line)
}

/// Parse one inbound line
pub fn decode_line(line: &str) -> Result<Response> {
    serde_json::from_str(line.trim())
        .map_err(|e| LifecycleError::ProtocolError(format!("Invalid JSON frame: {}", e)))
}

/// Operation names out of a discovery result
pub fn operation_names(result: &serde_json::Value) -> Vec<String> {
    result["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Counters shared between a connection and its codec
#[derive(Debug, Default)]
pub struct ConnectionStats {
    successes: AtomicU64,
    failures: AtomicU64,
    last_ping: RwLock<Option<DateTime<Utc>>>,
    operations: RwLock<Vec<String>>,
}

impl ConnectionStats {
    pub fn success_count(&self) -> u64 {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn last_ping(&self) -> Option<DateTime<Utc>> {
        *self.last_ping.read()
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.read().clone()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.read().len()
    }

    fn set_operations(&self, operations: Vec<String>) {
        *self.operations.write() = operations;
    }
}

struct PendingRequest {
    method: String,
    responder: oneshot::Sender<Response>,
}

/// Framing and dispatch bound to one connection.
///
/// Keeps the table of outstanding requests so every response resolves the
/// caller that sent the matching id.
pub struct ProtocolCodec {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    stats: Arc<ConnectionStats>,
}

impl ProtocolCodec {
    pub fn new(stats: Arc<ConnectionStats>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            stats,
        }
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Allocate an id, register the caller and produce the frame to send
    pub fn prepare(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<(u64, String, oneshot::Receiver<Response>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = encode_request(id, method, params)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                responder: tx,
            },
        );
        Ok((id, line, rx))
    }

    /// Drop a caller that gave up waiting
    pub fn forget(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Number of requests still awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fail every outstanding request, used when the transport goes away
    pub fn close_pending(&self) {
        let dropped = std::mem::take(&mut *self.pending.lock());
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Dropping pending requests");
        }
    }

    /// Handle one inbound line. Malformed lines are logged and dropped.
    pub fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        *self.stats.last_ping.write() = Some(Utc::now());

        let response = match decode_line(line) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        if response.error.is_some() {
            self.stats.failures.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats.successes.fetch_add(1, Ordering::SeqCst);
        }

        let Some(id) = response.id.as_ref().and_then(serde_json::Value::as_u64) else {
            trace!(method = ?response.method, "Unsolicited frame");
            return;
        };

        let Some(pending) = self.pending.lock().remove(&id) else {
            debug!(id, "Response for unknown or expired request");
            return;
        };

        if pending.method == DISCOVERY_METHOD && response.error.is_none() {
            if let Some(result) = &response.result {
                self.stats.set_operations(operation_names(result));
            }
        }

        // The caller may have timed out between lookup and send.
        let _ = pending.responder.send(response);
    }
}

impl std::fmt::Debug for ProtocolCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolCodec")
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_line_lossy_survives_invalid_utf8() {
        let mut input: &[u8] = b"first\nbad \xff byte\r\nlast";
        let mut buf = Vec::new();
        let mut lines = Vec::new();
        while let Some(line) = read_line_lossy(&mut input, &mut buf).await.unwrap() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["first", "bad \u{fffd} byte", "last"]);
    }

    fn codec() -> ProtocolCodec {
        ProtocolCodec::new(Arc::new(ConnectionStats::default()))
    }

    #[test]
    fn test_request_is_one_terminated_line() {
        let line = encode_request(7, PING_METHOD, serde_json::json!({})).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "ping");
    }

    #[tokio::test]
    async fn test_response_resolves_matching_caller() {
        let codec = codec();
        let (first, _, rx_first) = codec.prepare(PING_METHOD, serde_json::json!({})).unwrap();
        let (second, _, rx_second) = codec.prepare(PING_METHOD, serde_json::json!({})).unwrap();

        codec.handle_line(&format!(r#"{{"jsonrpc":"2.0","id":{second},"result":{{"n":2}}}}"#));
        codec.handle_line(&format!(r#"{{"jsonrpc":"2.0","id":{first},"result":{{"n":1}}}}"#));

        assert_eq!(rx_first.await.unwrap().result.unwrap()["n"], 1);
        assert_eq!(rx_second.await.unwrap().result.unwrap()["n"], 2);
        assert_eq!(codec.pending_count(), 0);
        assert_eq!(codec.stats().success_count(), 2);
    }

    #[test]
    fn test_error_response_counts_failure() {
        let codec = codec();
        let (id, _, _rx) = codec.prepare(PING_METHOD, serde_json::json!({})).unwrap();
        codec.handle_line(&format!(
            r#"{{"jsonrpc":"2.0","id":{id},"error":{{"code":-32601,"message":"nope"}}}}"#
        ));
        assert_eq!(codec.stats().failure_count(), 1);
        assert_eq!(codec.stats().success_count(), 0);
    }

    #[test]
    fn test_malformed_line_is_dropped() {
        let codec = codec();
        codec.handle_line("not json at all");
        assert_eq!(codec.stats().success_count(), 0);
        assert_eq!(codec.stats().failure_count(), 0);
        assert!(codec.stats().last_ping().is_some());
    }

    #[test]
    fn test_discovery_response_updates_operations() {
        let codec = codec();
        let (id, _, _rx) = codec.prepare(DISCOVERY_METHOD, serde_json::json!({})).unwrap();
        codec.handle_line(&format!(
            r#"{{"jsonrpc":"2.0","id":{id},"result":{{"tools":[{{"name":"read"}},{{"name":"write"}}]}}}}"#
        ));
        assert_eq!(codec.stats().operations(), vec!["read", "write"]);
    }

    #[tokio::test]
    async fn test_close_pending_fails_callers() {
        let codec = codec();
        let (_, _, rx) = codec.prepare(PING_METHOD, serde_json::json!({})).unwrap();
        codec.close_pending();
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_into_result_maps_rpc_error() {
        let response = Response {
            error: Some(RpcErrorObject {
                code: -1,
                message: "bad".into(),
                data: None,
            }),
            ..Default::default()
        };
        assert!(matches!(
            response.into_result(),
            Err(LifecycleError::RpcError { code: -1, .. })
        ));
    }
}
