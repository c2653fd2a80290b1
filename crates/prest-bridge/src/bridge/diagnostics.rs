//! Collected stderr output of the core.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// How many trailing lines to show when no panic message is recognized.
const TAIL_LINES: usize = 5;

/// Everything the core wrote to stderr so far. Shared with the reader task.
#[derive(Debug, Clone, Default)]
pub struct StderrBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl StderrBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // a panicking writer leaves valid bytes behind
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    /// Lossy UTF-8 snapshot of the buffer.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    /// Drain `stream` into the buffer until EOF or a read error.
    pub fn spawn_reader<R>(&self, mut stream: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => buffer.append(&chunk[..n]),
                    Err(e) => {
                        tracing::debug!(error = %e, "stderr reader stopped");
                        break;
                    }
                }
            }
        })
    }
}

/// Stderr of a core that died or misbehaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub stderr: String,
}

impl Diagnostics {
    pub fn new(stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
        }
    }

    pub fn excerpt(&self) -> String {
        salient_excerpt(&self.stderr)
    }
}

/// The part of a death note worth showing to a user.
///
/// For a Rust panic that is the `panicked at` location plus the message line
/// after it; otherwise the last few non-empty lines.
pub fn salient_excerpt(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().map(str::trim_end).collect();

    if let Some(i) = lines.iter().rposition(|l| l.contains("panicked at")) {
        let mut excerpt = lines[i].trim().to_string();
        if let Some(message) = lines[i + 1..].iter().find(|l| !l.trim().is_empty())
            && !message.starts_with("note:")
        {
            excerpt.push('\n');
            excerpt.push_str(message.trim());
        }
        return excerpt;
    }

    let tail: Vec<&str> = lines
        .iter()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(TAIL_LINES)
        .copied()
        .collect();
    tail.into_iter().rev().collect::<Vec<_>>().join("\n")
}
