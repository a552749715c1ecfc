//! Connection log: one formatted line per finished transfer, distinct
//! from the structured process log emitted through `tracing`. A single
//! bounded single-consumer channel feeds the file/stdout writer, rather
//! than a larger structured-JSON audit event scheme.

use crate::error::TftpError;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Queue depth for the bounded channel feeding the log consumer task.
const QUEUE_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Put,
    Unknown,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Get => "GET",
            Operation::Put => "PUT",
            Operation::Unknown => "UNK",
        }
    }
}

/// One transfer's outcome. Created at handshake (with `start` set),
/// finalized by the transfer task on exit, then handed to the log
/// consumer.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub op: Operation,
    pub client: SocketAddr,
    pub file: String,
    pub bytes: usize,
    pub error: Option<String>,
}

impl LogEntry {
    pub fn new(op: Operation, client: SocketAddr, file: String) -> Self {
        Self {
            start: Utc::now(),
            duration: Duration::ZERO,
            op,
            client,
            file,
            bytes: 0,
            error: None,
        }
    }

    pub fn finish_ok(&mut self, bytes: usize) {
        self.bytes = bytes;
    }

    pub fn finish_err(&mut self, err: &TftpError) {
        self.error = Some(err.to_string());
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let base = format!(
            "{}, {}, {:?}",
            self.start.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.op.as_str(),
            self.duration
        );
        match &self.error {
            Some(e) => write!(f, "{base}, ERROR: {e}"),
            None => write!(f, "{base}, SUCCESS: '{}', {} bytes", self.file, self.bytes),
        }
    }
}

/// A single-producer-per-task, single-consumer bounded queue, plus the
/// long-lived consumer task that drains it.
#[derive(Clone)]
pub struct ConnectionLog {
    sender: mpsc::Sender<LogEntry>,
}

impl ConnectionLog {
    /// Spawn the consumer task and return a handle transfer tasks can
    /// clone and send entries through. `log_path` is `None` for the
    /// stdout/trace-only mode.
    pub fn spawn(log_path: Option<PathBuf>) -> Self {
        let (tx, mut rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                match entry.error.is_some() {
                    true => tracing::warn!(target: "connlog", %entry, "transfer failed"),
                    false => tracing::info!(target: "connlog", %entry, "transfer completed"),
                }
                if let Some(path) = &log_path {
                    if let Err(e) = append_line(path, &entry.to_string()).await {
                        tracing::error!(target: "connlog", error = %e, "failed writing connection log");
                    }
                } else {
                    println!("{entry}");
                }
            }
        });
        Self { sender: tx }
    }

    /// Enqueue a finished entry. Never blocks the caller on a full log
    /// file write; only on the bounded channel itself.
    pub async fn record(&self, entry: LogEntry) {
        if self.sender.send(entry).await.is_err() {
            tracing::error!(target: "connlog", "connection log consumer has shut down");
        }
    }
}

/// Open-append-close so an external log rotation tool can safely move the
/// file out from under a long-running server.
async fn append_line(path: &PathBuf, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}
