//! Access log records and the writer task.
//!
//! One line per request:
//!
//! ```text
//! <host> - [<dd/mm/yyyy:HH:MM:SS +zzzz>] "<METHOD> <path?query> <proto>" <status> <bytes>
//!     "<referer>" "<user-agent>" <remote_addr> response_time:<secs.nanos> app_id:<id>
//! ```
//!
//! Missing status, finish time or backend are written as `-`.

use std::fmt::{self, Write as _};
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::registry::Backend;

/// Summary of one proxied request.
#[derive(Debug, Clone)]
pub struct AccessLogRecord {
    pub host: String,
    pub method: String,
    /// Path plus query string, as received.
    pub uri: String,
    pub proto: String,
    pub referer: String,
    pub user_agent: String,
    pub remote_addr: String,
    pub status: Option<u16>,
    pub backend: Option<Arc<Backend>>,
    pub started_at: DateTime<Local>,
    pub first_byte_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
    pub body_bytes_sent: u64,
}

impl AccessLogRecord {
    fn response_time(&self) -> Option<String> {
        let elapsed = (self.finished_at? - self.started_at).to_std().ok()?;
        Some(format!("{}.{:09}", elapsed.as_secs(), elapsed.subsec_nanos()))
    }

    /// The formatted line, newline included.
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(256);
        // Writing to a String cannot fail.
        let _ = writeln!(line, "{}", self);
        line
    }
}

impl fmt::Display for AccessLogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - [{}] \"{} {} {}\" ",
            self.host,
            self.started_at.format("%d/%m/%Y:%H:%M:%S %z"),
            self.method,
            self.uri,
            self.proto,
        )?;

        match self.status {
            Some(status) => write!(f, "{} ", status)?,
            None => f.write_str("- ")?,
        }

        write!(
            f,
            "{} \"{}\" \"{}\" {} ",
            self.body_bytes_sent, self.referer, self.user_agent, self.remote_addr,
        )?;

        match self.response_time() {
            Some(t) => write!(f, "response_time:{} ", t)?,
            None => f.write_str("response_time:- ")?,
        }

        match &self.backend {
            Some(backend) => write!(f, "app_id:{}", backend.application_id),
            None => f.write_str("app_id:-"),
        }
    }
}

/// Handle for queueing records to the writer task.
#[derive(Debug, Clone)]
pub struct AccessLogger {
    tx: mpsc::UnboundedSender<AccessLogRecord>,
}

impl AccessLogger {
    /// Start a task appending formatted records to `writer`. The task exits
    /// once every logger handle is dropped.
    pub fn spawn<W>(mut writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<AccessLogRecord>();

        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = writer.write_all(record.to_line().as_bytes()).await {
                    tracing::warn!(error = %e, "Failed to write access log record");
                    continue;
                }
                if rx.is_empty() {
                    if let Err(e) = writer.flush().await {
                        tracing::warn!(error = %e, "Failed to flush access log");
                    }
                }
            }
            let _ = writer.flush().await;
            tracing::debug!("Access log writer exited");
        });

        (Self { tx }, handle)
    }

    /// Open `path` for appending and start a writer on it.
    pub async fn open(path: &Path) -> io::Result<(Self, JoinHandle<()>)> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        tracing::info!(path = %path.display(), "Access log opened");
        Ok(Self::spawn(file))
    }

    /// Queue `record` for the writer task. Never blocks.
    pub fn log(&self, record: AccessLogRecord) {
        if self.tx.send(record).is_err() {
            tracing::debug!("Access log writer is gone, dropping record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    use crate::registry::BackendId;

    fn at(secs: i64, nanos: u32) -> DateTime<Local> {
        Local.timestamp_opt(secs, nanos).unwrap()
    }

    fn record() -> AccessLogRecord {
        let backend = Backend {
            id: BackendId::new("127.0.0.1", 4567),
            application_id: "my_awesome_id".to_string(),
            host: "127.0.0.1".to_string(),
            port: 4567,
            tags: HashMap::new(),
            private_instance_id: String::new(),
        };

        AccessLogRecord {
            host: "foo.bar".to_string(),
            method: "GET".to_string(),
            uri: "/quz?wat".to_string(),
            proto: "HTTP/1.1".to_string(),
            referer: "referer".to_string(),
            user_agent: "user-agent".to_string(),
            remote_addr: "1.2.3.4:5678".to_string(),
            status: Some(200),
            backend: Some(Arc::new(backend)),
            started_at: at(10, 100_000_000),
            first_byte_at: Some(at(10, 200_000_000)),
            finished_at: Some(at(10, 300_000_000)),
            body_bytes_sent: 42,
        }
    }

    #[test]
    fn test_record_format() {
        let record = record();
        let line = record.to_line();

        let timestamp = record.started_at.format("%d/%m/%Y:%H:%M:%S %z").to_string();
        let expected = format!(
            "foo.bar - [{}] \"GET /quz?wat HTTP/1.1\" 200 42 \"referer\" \"user-agent\" 1.2.3.4:5678 response_time:0.200000000 app_id:my_awesome_id\n",
            timestamp
        );
        assert_eq!(line, expected);

        assert_eq!(timestamp.len(), "01/01/1970:00:00:10 +0000".len());
        assert!(timestamp[20..].starts_with('+') || timestamp[20..].starts_with('-'));
    }

    #[test]
    fn test_missing_fields_use_dash() {
        let mut record = record();
        record.status = None;
        record.backend = None;
        record.finished_at = None;
        record.body_bytes_sent = 0;

        let line = record.to_line();
        assert!(line.contains("\"GET /quz?wat HTTP/1.1\" - 0 "));
        assert!(line.contains(" response_time:- "));
        assert!(line.ends_with(" app_id:-\n"));
    }

    #[tokio::test]
    async fn test_logger_writes_lines() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (logger, handle) = AccessLogger::spawn(client);

        logger.log(record());
        logger.log(record());
        drop(logger);
        handle.await.unwrap();

        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("foo.bar - ["));
    }

    #[tokio::test]
    async fn test_open_appends_to_file() {
        let path = std::env::temp_dir().join(format!("access-{}.log", uuid::Uuid::new_v4()));
        std::fs::write(&path, "existing\n").unwrap();

        let (logger, handle) = AccessLogger::open(&path).await.unwrap();
        logger.log(record());
        drop(logger);
        handle.await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("existing\nfoo.bar - ["));
        let _ = std::fs::remove_file(&path);
    }
}
