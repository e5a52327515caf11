//! QMP (QEMU Machine Protocol) client.
//!
//! Talks to a single QEMU instance over its unix control socket: reads the greeting, negotiates
//! capabilities, then sends one request and reads one response per connection (no pipelining).
//! Unlike a brace-scanning reader, this client consumes one JSON value per line and discards
//! asynchronous event objects (`{"event": ...}`) while it waits for the command's reply — QMP
//! interleaves events with command responses on the same socket.

use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::trace;

/// A single-shot QMP connection: greeting, capabilities negotiation, one command.
pub struct QmpClient {
    reader: BufReader<UnixStream>,
}

impl QmpClient {
    /// Connects to `socket_path`, reads the greeting and negotiates capabilities.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| Error::Protocol(format!("connect {}: {e}", socket_path.display())))?;
        let mut reader = BufReader::new(stream);

        let greeting: QmpGreeting = read_value(&mut reader).await?;
        if greeting.qmp.is_none() {
            return Err(Error::Protocol("missing QMP greeting".into()));
        }

        write_command(&mut reader, "qmp_capabilities", None::<()>).await?;
        let _resp: QmpResponse<serde_json::Value> = read_response(&mut reader).await?;

        Ok(Self { reader })
    }

    /// Sends a single command and returns its decoded `return` payload.
    pub async fn execute<A: Serialize, R: DeserializeOwned>(
        &mut self,
        command: &str,
        arguments: Option<A>,
    ) -> Result<R> {
        write_command(&mut self.reader, command, arguments).await?;
        let response: QmpResponse<R> = read_response(&mut self.reader).await?;
        if let Some(err) = response.error {
            return Err(Error::Protocol(format!("{}: {}", err.class, err.desc)));
        }
        response.result.ok_or_else(|| Error::Protocol("no return value".into()))
    }

    async fn execute_void<A: Serialize>(&mut self, command: &str, arguments: Option<A>) -> Result<()> {
        let _: serde_json::Value = self.execute(command, arguments).await?;
        Ok(())
    }

    pub async fn query_status(&mut self) -> Result<QueryStatus> {
        self.execute("query-status", None::<()>).await
    }

    pub async fn system_powerdown(&mut self) -> Result<()> {
        self.execute_void("system_powerdown", None::<()>).await
    }

    pub async fn system_reset(&mut self) -> Result<()> {
        self.execute_void("system_reset", None::<()>).await
    }

    pub async fn query_version(&mut self) -> Result<QemuVersion> {
        self.execute("query-version", None::<()>).await
    }
}

/// Waits for `socket_path` to appear and accept a QMP connection, up to `timeout`.
pub async fn wait_for_qmp(socket_path: &Path, timeout: Duration) -> Result<QmpClient> {
    let start = tokio::time::Instant::now();
    loop {
        if socket_path.exists() {
            if let Ok(client) = QmpClient::connect(socket_path).await {
                return Ok(client);
            }
        }
        if start.elapsed() > timeout {
            return Err(Error::Timeout(format!(
                "QMP socket {} did not come up within {:?}",
                socket_path.display(),
                timeout
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn write_command<A: Serialize>(
    reader: &mut BufReader<UnixStream>,
    execute: &str,
    arguments: Option<A>,
) -> Result<()> {
    let cmd = QmpCommand {
        execute: execute.to_string(),
        arguments,
    };
    let mut line = serde_json::to_string(&cmd)?;
    line.push('\n');
    trace!(command = %execute, "QMP ->");
    let writer = reader.get_mut();
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one JSON value from the stream, ignoring nothing — used for the initial greeting.
async fn read_value<T: DeserializeOwned>(reader: &mut BufReader<UnixStream>) -> Result<T> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::Protocol("QMP connection closed".into()));
    }
    trace!(raw = %line.trim(), "QMP <-");
    serde_json::from_str(&line).map_err(Error::Serialization)
}

/// Reads JSON values until one that isn't an async event, skipping `{"event": ...}` frames.
async fn read_response<R: DeserializeOwned>(reader: &mut BufReader<UnixStream>) -> Result<QmpResponse<R>> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Protocol("QMP connection closed".into()));
        }
        trace!(raw = %line.trim(), "QMP <-");

        let value: serde_json::Value = serde_json::from_str(&line)?;
        if value.get("event").is_some() {
            continue;
        }
        return serde_json::from_value(value).map_err(Error::Serialization);
    }
}

#[derive(Debug, Serialize)]
struct QmpCommand<A> {
    execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<A>,
}

#[derive(Debug, Deserialize)]
struct QmpGreeting {
    #[serde(rename = "QMP")]
    qmp: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct QmpResponse<T> {
    #[serde(rename = "return")]
    result: Option<T>,
    error: Option<QmpError>,
}

#[derive(Debug, Deserialize)]
struct QmpError {
    class: String,
    desc: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryStatus {
    pub running: bool,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QemuVersion {
    pub qemu: QemuVersionDetail,
    pub package: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QemuVersionDetail {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_serializes_without_null_arguments() {
        let cmd = QmpCommand {
            execute: "qmp_capabilities".to_string(),
            arguments: None::<()>,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"execute":"qmp_capabilities"}"#);
    }

    #[test]
    fn response_parses_error() {
        let json = r#"{"error": {"class": "GenericError", "desc": "boom"}}"#;
        let resp: QmpResponse<serde_json::Value> = serde_json::from_str(json).unwrap();
        assert_eq!(resp.error.unwrap().class, "GenericError");
    }

    #[test]
    fn response_parses_status() {
        let json = r#"{"return": {"running": true, "status": "running"}}"#;
        let resp: QmpResponse<QueryStatus> = serde_json::from_str(json).unwrap();
        assert!(resp.result.unwrap().running);
    }

    #[test]
    fn event_objects_are_recognizable_by_key() {
        let json = r#"{"event": "SHUTDOWN", "timestamp": {"seconds": 1, "microseconds": 0}}"#;
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert!(value.get("event").is_some());
    }
}
