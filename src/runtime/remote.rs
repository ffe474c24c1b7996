use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;

use super::{AgentEvent, AgentRuntime, Emit, TurnRequest, TurnResult};
use crate::errors::RuntimeError;

/// Streaming remote runtime: the turn request is POSTed to
/// `<base_url>/v1/turns` and the response body is an NDJSON stream of frames.
/// Each frame carries either an intermediate event (republished to the hub)
/// or the final result, which terminates the turn. Dropping the turn future
/// closes the connection and aborts the remote turn.
#[derive(Debug, Clone)]
pub struct RemoteRuntime {
    pub base_url: String,
    client: reqwest::Client,
}

impl RemoteRuntime {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

/// One wire frame: exactly one of `event` or `result` is present.
#[derive(Debug, Deserialize)]
struct TurnFrame {
    #[serde(default)]
    event: Option<AgentEvent>,
    #[serde(default)]
    result: Option<TurnResult>,
}

#[async_trait]
impl AgentRuntime for RemoteRuntime {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn run_turn(&self, req: TurnRequest, emit: Emit<'_>) -> Result<TurnResult, RuntimeError> {
        let url = format!("{}/v1/turns", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RuntimeError::Stream(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RuntimeError::Stream(format!(
                "remote runtime returned {}",
                resp.status()
            )));
        }

        let mut body = resp.bytes_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RuntimeError::Stream(e.to_string()))?;
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let frame: TurnFrame = serde_json::from_str(line)
                    .map_err(|e| RuntimeError::Stream(format!("bad frame: {}", e)))?;
                if let Some(mut ev) = frame.event {
                    ev.ensure_timestamp();
                    emit(ev);
                }
                if let Some(result) = frame.result {
                    return Ok(result);
                }
            }
        }
        Err(RuntimeError::Stream(
            "stream closed before a result frame".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Minimal NDJSON endpoint: accepts one request and streams canned
    /// frames back.
    async fn serve_once(frames: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let (mut sock, _) = listener.accept().await.unwrap();
            // Drain the request until the JSON body's closing brace has
            // arrived, so the client is never mid-write when we respond.
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                if request.ends_with(b"}") {
                    break;
                }
            }
            let body = frames.as_bytes();
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\ncontent-type: application/x-ndjson\r\n\r\n",
                body.len()
            );
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(body).await.unwrap();
            let _ = sock.read(&mut chunk).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_events_republished_and_result_terminates() {
        let base = serve_once(
            "{\"event\":{\"type\":\"turn_started\"}}\n{\"event\":{\"type\":\"agent_activity\"}}\n{\"result\":{\"output\":\"submit_for_review\"}}\n",
        )
        .await;
        let events: Mutex<Vec<AgentEvent>> = Mutex::new(Vec::new());
        let rt = RemoteRuntime::new(&base);
        let result = rt
            .run_turn(TurnRequest::default(), &|ev| events.lock().unwrap().push(ev))
            .await
            .unwrap();
        assert_eq!(result.output, "submit_for_review");
        assert_eq!(events.into_inner().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stream_without_result_is_an_error() {
        let base = serve_once("{\"event\":{\"type\":\"turn_started\"}}\n").await;
        let rt = RemoteRuntime::new(&base);
        let err = rt.run_turn(TurnRequest::default(), &|_| {}).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Stream(_)));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let rt = RemoteRuntime::new("http://localhost:9999/");
        assert_eq!(rt.base_url, "http://localhost:9999");
    }
}
