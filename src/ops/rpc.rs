//! Line-delimited JSON-RPC 2.0 surface over stdio
//!
//! The framing is a transport choice; everything behind `method`/`params`
//! is the operation table. One request per line in, one response per line
//! out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;

use super::Services;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request ID: string or number per the JSON-RPC spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

impl RpcResponse {
    fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

/// Serve requests from stdin until EOF or shutdown.
pub async fn serve_stdio(
    services: Arc<Services>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("rpc surface shutting down");
                return Ok(());
            }
            read = reader.read_line(&mut line) => read?,
        };
        if read == 0 {
            tracing::info!("stdin closed, rpc surface exiting");
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(trimmed) {
            Ok(request) => {
                let args = request.params.unwrap_or_else(|| Value::Object(Default::default()));
                let result = super::dispatch(&services, &request.method, args).await;
                RpcResponse::new(request.id, result)
            }
            Err(err) => RpcResponse::new(
                RequestId::Number(0),
                serde_json::json!({
                    "ok": false,
                    "error": format!("request did not parse: {}", err),
                    "error_code": crate::error::ErrorCode::InvalidParameterType,
                    "recovery": ["send one JSON-RPC 2.0 request per line"],
                }),
            ),
        };

        let encoded = serde_json::to_string(&response)?;
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
}
