use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

/// What happened to one item; rendered as the verb of its log line.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    UploadNeeded,
    CompareFailed,
    Uploaded,
    UploadFailed,
    Deleted,
    DeleteFailed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let verb = match self {
            Outcome::Unchanged => "unchanged",
            Outcome::UploadNeeded => "upload needed",
            Outcome::CompareFailed => "compare failed",
            Outcome::Uploaded => "uploaded",
            Outcome::UploadFailed => "upload failed",
            Outcome::Deleted => "deleted",
            Outcome::DeleteFailed => "delete failed",
        };
        write!(f, "{verb}")
    }
}

#[must_use]
pub fn format_line(
    progress: (u64, u64),
    outcome: Outcome,
    remote_path: &str,
    dry_run: bool,
) -> String {
    let marker = if dry_run { " (dry-run)" } else { "" };
    format!(
        "[{}/{}] {} {}{}",
        progress.0, progress.1, outcome, remote_path, marker
    )
}

#[derive(Debug, Clone)]
enum Sink {
    Disabled,
    Stdout,
    File(std::sync::Arc<tokio::sync::Mutex<tokio::io::BufWriter<tokio::fs::File>>>),
    Memory(std::sync::Arc<std::sync::Mutex<Vec<String>>>),
}

/// Per-item output, one line per completed item.
#[derive(Debug, Clone)]
pub struct ItemLog {
    sink: Sink,
}

impl ItemLog {
    /// Lines go to `log_path` if given (the file must not exist yet), otherwise to stdout unless
    /// `quiet` is set.
    pub async fn new(log_path: Option<&std::path::Path>, quiet: bool) -> Result<Self> {
        let sink = if let Some(log_path) = log_path {
            let log_file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(log_path)
                .await
                .with_context(|| format!("Failed to open log file: {log_path:?}"))?;
            Sink::File(std::sync::Arc::new(tokio::sync::Mutex::new(
                tokio::io::BufWriter::new(log_file),
            )))
        } else if quiet {
            Sink::Disabled
        } else {
            Sink::Stdout
        };
        Ok(Self { sink })
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            sink: Sink::Disabled,
        }
    }

    /// Keeps lines in memory, see [`ItemLog::lines`].
    #[must_use]
    pub fn capture() -> Self {
        Self {
            sink: Sink::Memory(std::sync::Arc::new(std::sync::Mutex::new(vec![]))),
        }
    }

    /// Writes one line; failing to write is logged and otherwise ignored.
    pub async fn record(
        &self,
        progress: (u64, u64),
        outcome: Outcome,
        remote_path: &str,
        dry_run: bool,
    ) {
        let line = format_line(progress, outcome, remote_path, dry_run);
        if let Err(error) = self.write(line).await {
            tracing::warn!("{:#}", error);
        }
    }

    async fn write(&self, line: String) -> Result<()> {
        match &self.sink {
            Sink::Disabled => {}
            Sink::Stdout => {
                use std::io::Write;
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{line}").context("Failed to write to stdout")?;
            }
            Sink::File(log) => {
                let mut log = log.lock().await;
                log.write_all(line.as_bytes())
                    .await
                    .context("Failed to write to log file")?;
                log.write_all(b"\n")
                    .await
                    .context("Failed to write to log file")?;
            }
            Sink::Memory(lines) => lines
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(line),
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        match &self.sink {
            Sink::File(log) => {
                let mut log = log.lock().await;
                log.flush().await.context("Failed to flush log file")?;
            }
            Sink::Stdout => {
                use std::io::Write;
                std::io::stdout().flush().context("Failed to flush stdout")?;
            }
            Sink::Disabled | Sink::Memory(_) => {}
        }
        Ok(())
    }

    /// Captured lines, empty unless created with [`ItemLog::capture`].
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        match &self.sink {
            Sink::Memory(lines) => lines
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
            _ => vec![],
        }
    }
}
