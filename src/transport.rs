use crate::resolver::TransportSpec;
use anyhow::Result;
use futures::StreamExt;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

const RESPONSE_TIMEOUT_SECS: u64 = 30;

/// A connected stdio MCP server subprocess
#[derive(Debug)]
pub struct StdioTransport {
    process: Child,
    stdin: tokio::process::ChildStdin,
    stdout_reader: BufReader<tokio::process::ChildStdout>,
    next_request_id: u64,
}

/// An HTTP/SSE MCP server endpoint.
///
/// `message_url` is where JSON-RPC POSTs go; for SSE servers it is
/// discovered from the first SSE frame (`data: /message?sessionId=...`),
/// otherwise it is the configured URL itself.
#[derive(Debug)]
pub struct SseTransport {
    sse_url: String,
    message_url: String,
    client: reqwest::Client,
    next_request_id: u64,
}

#[derive(Debug)]
pub enum Transport {
    Stdio(StdioTransport),
    Sse(SseTransport),
}

impl Transport {
    pub async fn connect(spec: &TransportSpec) -> Result<Self> {
        match spec {
            TransportSpec::Stdio { command, args } => {
                Ok(Transport::Stdio(StdioTransport::spawn(command, args).await?))
            }
            TransportSpec::Sse { url } => Ok(Transport::Sse(SseTransport::open(url).await?)),
        }
    }

    /// The configured SSE URL, when this transport has one. Stdio
    /// transports expose no URL, which is why the forwarder re-resolves
    /// endpoints from stored config instead of asking the transport.
    pub fn sse_url(&self) -> Option<&str> {
        match self {
            Transport::Stdio(_) => None,
            Transport::Sse(t) => Some(&t.sse_url),
        }
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self, Transport::Stdio(_))
    }

    /// Full JSON-RPC round trip: assigns a request id, sends, and waits
    /// for the matching response.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        match self {
            Transport::Stdio(t) => t.request(method, params).await,
            Transport::Sse(t) => t.request(method, params).await,
        }
    }

    pub async fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        match self {
            Transport::Stdio(t) => t.notify(method, params).await,
            Transport::Sse(t) => t.notify(method, params).await,
        }
    }

    /// Send a caller-built JSON-RPC message as-is. Messages carrying an
    /// `id` produce a response; notifications produce `None`.
    pub async fn send_raw(&mut self, message: &Value) -> Result<Option<Value>> {
        match self {
            Transport::Stdio(t) => t.send_raw(message).await,
            Transport::Sse(t) => t.send_raw(message).await,
        }
    }
}

impl StdioTransport {
    async fn spawn(command: &str, args: &[String]) -> Result<Self> {
        println!("🚀 Spawning stdio MCP server: {} {}", command, args.join(" "));

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.envs(std::env::vars());

        let mut process = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn '{command}': {e}"))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to take stdin for '{command}'"))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to take stdout for '{command}'"))?;
        let stderr = process
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to take stderr for '{command}'"))?;

        // Drain stderr so the child never blocks on a full pipe
        let command_name = command.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if !line.trim().is_empty() {
                            eprintln!("🔍 [{}] stderr: {}", command_name, line.trim());
                        }
                    }
                }
            }
        });

        Ok(Self {
            process,
            stdin,
            stdout_reader: BufReader::new(stdout),
            next_request_id: 1,
        })
    }

    fn take_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    async fn write_line(&mut self, message: &Value) -> Result<()> {
        let line = format!("{}\n", serde_json::to_string(message)?);
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write to MCP server: {e}"))?;
        Ok(())
    }

    /// Read lines until an actual response shows up (has `id` and either
    /// `result` or `error`). Notifications and non-JSON status chatter are
    /// skipped.
    async fn read_response(&mut self) -> Result<Value> {
        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = tokio::time::timeout(
                tokio::time::Duration::from_secs(RESPONSE_TIMEOUT_SECS),
                self.stdout_reader.read_line(&mut line),
            )
            .await
            .map_err(|_| anyhow::anyhow!("Timeout reading response"))?
            .map_err(|e| anyhow::anyhow!("Failed to read response: {e}"))?;

            if bytes_read == 0 {
                return Err(anyhow::anyhow!("Server connection closed"));
            }

            if let Ok(response) = serde_json::from_str::<Value>(&line) {
                if response.get("method").is_some() && response.get("id").is_none() {
                    continue;
                }
                if response.get("id").is_some()
                    && (response.get("result").is_some() || response.get("error").is_some())
                {
                    return Ok(response);
                }
            }
        }
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.take_request_id();
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.write_line(&request).await?;
        self.read_response().await
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_line(&notification).await
    }

    async fn send_raw(&mut self, message: &Value) -> Result<Option<Value>> {
        self.write_line(message).await?;
        if message.get("id").is_some() {
            Ok(Some(self.read_response().await?))
        } else {
            Ok(None)
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.process.kill().await;
    }
}

impl SseTransport {
    async fn open(url: &str) -> Result<Self> {
        let client = reqwest::Client::new();

        // SSE servers announce their POST endpoint in the first frame of
        // the event stream; plain HTTP servers take POSTs at the URL itself.
        let message_url = if url.ends_with("/sse") {
            match Self::discover_message_url(&client, url).await {
                Ok(discovered) => {
                    println!("🎯 SSE message URL: {discovered}");
                    discovered
                }
                Err(e) => {
                    eprintln!("⚠️ SSE handshake failed for {url}, falling back to direct POST: {e}");
                    url.to_string()
                }
            }
        } else {
            url.to_string()
        };

        Ok(Self {
            sse_url: url.to_string(),
            message_url,
            client,
            next_request_id: 1,
        })
    }

    async fn discover_message_url(client: &reqwest::Client, url: &str) -> Result<String> {
        let response = client
            .get(url)
            .header("Accept", "text/event-stream")
            .send()
            .await?;

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.contains("text/event-stream") {
            return Ok(url.to_string());
        }

        let mut body = response.bytes_stream();
        let first_chunk = match body.next().await {
            Some(Ok(chunk)) => String::from_utf8_lossy(&chunk).to_string(),
            Some(Err(e)) => return Err(anyhow::anyhow!("Failed to read SSE chunk: {e}")),
            None => return Err(anyhow::anyhow!("No data received from SSE endpoint")),
        };

        // Expected shape: "event: endpoint\ndata: /message?sessionId=xxx"
        let data_line = first_chunk
            .lines()
            .find(|line| line.starts_with("data: "))
            .ok_or_else(|| anyhow::anyhow!("No data line found in SSE response"))?;
        let endpoint_path = data_line.strip_prefix("data: ").unwrap_or("");
        let session_id = endpoint_path
            .split("sessionId=")
            .nth(1)
            .ok_or_else(|| anyhow::anyhow!("No sessionId found in SSE response"))?;

        let base_url = url.trim_end_matches("/sse").trim_end_matches('/');
        Ok(format!("{base_url}/message?sessionId={session_id}"))
    }

    fn take_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    async fn post(&self, message: &Value) -> Result<Option<Value>> {
        let response = self
            .client
            .post(&self.message_url)
            .header("Accept", "application/json, text/event-stream")
            .json(message)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("HTTP request failed: {e}"))?;

        let text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read HTTP response: {e}"))?;
        if text.trim().is_empty() {
            return Ok(None);
        }

        let payload = extract_json_payload(&text);
        Ok(Some(serde_json::from_str(&payload).map_err(|e| {
            anyhow::anyhow!("Failed to parse response as JSON: {e}")
        })?))
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.take_request_id();
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.post(&request)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Server returned an empty response to '{method}'"))
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let _ = self.post(&notification).await?;
        Ok(())
    }

    async fn send_raw(&mut self, message: &Value) -> Result<Option<Value>> {
        self.post(message).await
    }

    #[cfg(test)]
    pub fn stub(sse_url: &str, message_url: &str) -> Self {
        Self {
            sse_url: sse_url.to_string(),
            message_url: message_url.to_string(),
            client: reqwest::Client::new(),
            next_request_id: 1,
        }
    }
}

/// Some servers answer POSTs with SSE-framed bodies
/// (`event: message\ndata: {json}`); extract the JSON either way.
pub fn extract_json_payload(response_text: &str) -> String {
    if response_text.contains("data: ")
        && (response_text.starts_with("event:") || response_text.starts_with("data:"))
    {
        let data_lines: Vec<&str> = response_text
            .lines()
            .filter(|line| line.starts_with("data: "))
            .collect();
        if !data_lines.is_empty() {
            return data_lines
                .iter()
                .map(|line| line.strip_prefix("data: ").unwrap_or(line))
                .collect::<Vec<_>>()
                .join("");
        }
    }
    response_text.to_string()
}
