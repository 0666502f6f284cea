use std::{collections::VecDeque, path::PathBuf, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

pub(crate) const STDERR_PREFIX: &str = "[stderr] ";
pub(crate) const STDOUT_PREFIX: &str = "[stdout] ";

/// Bounded, sequence-numbered buffer of server output lines.
#[derive(Debug)]
pub(crate) struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub(crate) fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub(crate) fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    pub(crate) fn last_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    pub(crate) fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // Convenience for UI polling: if cursor is 0, return the most recent lines.
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }

    /// Last `max_lines` stderr lines written after `cursor`, prefixes stripped.
    pub(crate) fn stderr_since(&self, cursor: u64, max_lines: usize) -> String {
        let picked: Vec<&str> = self
            .lines
            .iter()
            .filter(|(seq, _)| *seq > cursor)
            .filter_map(|(_, line)| line.strip_prefix(STDERR_PREFIX))
            .collect();
        let start = picked.len().saturating_sub(max_lines);
        picked[start..].join("\n")
    }
}

#[derive(Clone)]
pub(crate) struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    /// Sink feeding `buffer`, mirrored into a rotating file when `file` is set.
    ///
    /// The file writer task ends once every clone of the sink is dropped.
    pub(crate) fn new(
        buffer: Arc<Mutex<LogBuffer>>,
        file: Option<PathBuf>,
        max_bytes: u64,
        max_files: usize,
    ) -> Self {
        let file_tx = file.map(|path| {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            tokio::spawn(async move {
                let mut writer = match FileLogWriter::open(path.clone(), max_bytes, max_files).await
                {
                    Ok(w) => w,
                    Err(e) => {
                        let path = path.display();
                        tracing::warn!(%path, error = %e, "console log unavailable");
                        return;
                    }
                };
                while let Some(line) = rx.recv().await {
                    let _ = writer.write_line(&line).await;
                }
            });
            tx
        });
        Self { buffer, file_tx }
    }

    pub(crate) async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        self.buffer.lock().await.push_line(line.clone());
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line);
        }
    }
}

/// Copies `reader` line by line into `sink` until EOF.
pub(crate) fn pump_lines<R>(reader: R, prefix: &'static str, sink: LogSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.emit(format!("{prefix}{line}")).await;
        }
    })
}

struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    fn rotated(&self, n: usize) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.path.display(), n))
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        // Shift old rotations: .(n-1) -> .n
        for i in (1..self.max_files).rev() {
            let from = self.rotated(i);
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(from, self.rotated(i + 1)).await;
            }
        }

        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, self.rotated(1)).await;
        }

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let write_len = line.len() as u64;
        if self.max_bytes > 0 && self.bytes.saturating_add(write_len) > self.max_bytes {
            self.rotate().await.ok();
        }

        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        self.bytes = self.bytes.saturating_add(write_len);
        Ok(())
    }
}
