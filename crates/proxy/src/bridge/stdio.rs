//! Upstream over stdio
//!
//! One client, one session: newline-delimited JSON-RPC on the proxy's own
//! stdin/stdout. Logs never go to stdout.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::{ProxyError, ProxyResult};
use crate::mcp::types::{JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcResponse};
use crate::session::Session;

/// Serve `session` until the client closes its end
///
/// Each request is handled on its own task so slow calls never block the
/// reader. Returns `Ok` on EOF and `UpstreamTransportError` if either
/// direction of the pipe breaks.
pub async fn serve<R, W>(
    session: &Session,
    reader: R,
    writer: W,
    outbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
) -> ProxyResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer_task = tokio::spawn(write_messages(writer, outbound));
    let mut lines = BufReader::new(reader).lines();

    let result = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcMessage>(trimmed) {
                        Ok(message) => session.dispatch(message),
                        Err(e) => {
                            tracing::warn!(error = %e, "Invalid JSON-RPC message from client");
                            session.reply(JsonRpcResponse::error(
                                Some(JsonRpcId::Null),
                                JsonRpcError::parse_error(format!("Parse error: {}", e)),
                            ));
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!("Client closed stdin");
                    break Ok(());
                }
                Err(e) => break Err(ProxyError::UpstreamTransportError(e.to_string())),
            },
            written = &mut writer_task => {
                break match written {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(ProxyError::UpstreamTransportError(e.to_string())),
                };
            }
        }
    };

    writer_task.abort();
    result
}

async fn write_messages<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let mut line = serde_json::to_string(&message)
            .map_err(|e| ProxyError::Protocol(e.to_string()))?;
        line.push('\n');

        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProxyError::UpstreamTransportError(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| ProxyError::UpstreamTransportError(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mcp::client::Timeouts;
    use crate::mcp::testing::{FakeBackend, FakeConnector};
    use async_trait::async_trait;
    use mcpfuse_shared::{BackendDescriptor, DescriptorResolver, ResolveError};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    struct OneBackend;

    #[async_trait]
    impl DescriptorResolver for OneBackend {
        async fn resolve(&self, _credential: &str) -> Result<Vec<BackendDescriptor>, ResolveError> {
            Ok(vec![BackendDescriptor::stdio("fs", "fake", vec![])])
        }
    }

    #[tokio::test]
    async fn test_serves_client_until_eof() {
        let connector = FakeConnector::new();
        connector.add(FakeBackend::new("fs").with_tools(&["read"]));

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::open(
            "key",
            &OneBackend,
            Arc::new(connector),
            Timeouts::default(),
            tx,
        )
        .await
        .unwrap();

        let (client_in, proxy_in) = tokio::io::duplex(8192);
        let (proxy_out, client_out) = tokio::io::duplex(8192);

        let server = tokio::spawn(async move {
            let result = serve(&session, proxy_in, proxy_out, rx).await;
            session.close().await;
            result
        });

        let (_, mut client_writer) = tokio::io::split(client_in);
        client_writer
            .write_all(
                concat!(
                    r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
                    "\n",
                    "this is not json\n",
                    r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
                    "\n",
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut lines = BufReader::new(client_out).lines();
        let mut responses: HashMap<String, Value> = HashMap::new();
        while responses.len() < 3 {
            let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            responses.insert(value["id"].to_string(), value);
        }

        assert_eq!(responses["1"]["result"]["serverInfo"]["name"], "mcpfuse");
        assert_eq!(responses["null"]["error"]["code"], JsonRpcError::PARSE_ERROR);
        assert_eq!(responses["2"]["result"]["tools"][0]["name"], "fs::read");

        drop(client_writer);
        let result = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
