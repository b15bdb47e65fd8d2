//! Incremental reader over an agent's output file.
//!
//! Agents write straight into `output.log`; the supervisor follows that file
//! by offset so the same reader works for a freshly spawned agent and for one
//! reattached after a restart.

use std::io::{ErrorKind, SeekFrom};
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Debug, Default)]
pub struct LogTail {
    /// Where following started; bytes before it are backlog.
    start: u64,
    offset: u64,
    partial: String,
}

impl LogTail {
    /// Follow from the beginning of the file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow from the file's current end. A missing file starts at zero.
    pub fn from_end(path: &Path) -> Self {
        let len = std::fs::metadata(path).map_or(0, |m| m.len());
        Self {
            start: len,
            offset: len,
            partial: String::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Content written before following started.
    pub async fn read_backlog(&self, path: &Path) -> std::io::Result<String> {
        if self.start == 0 {
            return Ok(String::new());
        }
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e),
        };
        let mut buf = Vec::new();
        file.take(self.start).read_to_end(&mut buf).await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Complete lines appended since the previous read.
    pub async fn read_lines(&mut self, path: &Path) -> std::io::Result<Vec<String>> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();
        if len < self.offset {
            // Truncated underneath us; start over.
            self.start = 0;
            self.offset = 0;
            self.partial.clear();
        }
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;

        self.partial.push_str(&String::from_utf8_lossy(&buf));
        let mut lines: Vec<String> = self.partial.split('\n').map(str::to_string).collect();
        self.partial = lines.pop().unwrap_or_default();
        Ok(lines)
    }

    /// A trailing line the writer never terminated.
    pub fn take_partial(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}
