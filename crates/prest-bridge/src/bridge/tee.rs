//! Copies of the raw protocol streams, for debugging.

use std::fs::File;
use std::io::{self, Read, Write};

/// Mirror of one stream into a file. A failing mirror is dropped with a warning;
/// the stream itself is never affected.
#[derive(Debug)]
struct Mirror {
    name: &'static str,
    file: Option<File>,
}

impl Mirror {
    fn new(name: &'static str, file: File) -> Self {
        Self {
            name,
            file: Some(file),
        }
    }

    fn copy(&mut self, bytes: &[u8]) {
        if let Some(file) = self.file.as_mut()
            && let Err(e) = file.write_all(bytes)
        {
            tracing::warn!(stream = self.name, error = %e, "transcript write failed, disabling");
            self.file = None;
        }
    }

    fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}

/// Writer that also copies everything written into a transcript file.
#[derive(Debug)]
pub struct TeeWriter<W> {
    inner: W,
    mirror: Mirror,
}

impl<W: Write> TeeWriter<W> {
    pub fn new(inner: W, transcript: File) -> Self {
        Self {
            inner,
            mirror: Mirror::new("requests", transcript),
        }
    }
}

impl<W: Write> Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.mirror.copy(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.mirror.flush();
        self.inner.flush()
    }
}

/// Reader that also copies everything read into a transcript file.
#[derive(Debug)]
pub struct TeeReader<R> {
    inner: R,
    mirror: Mirror,
}

impl<R: Read> TeeReader<R> {
    pub fn new(inner: R, transcript: File) -> Self {
        Self {
            inner,
            mirror: Mirror::new("responses", transcript),
        }
    }
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.mirror.copy(&buf[..n]);
        if n == 0 {
            self.mirror.flush();
        }
        Ok(n)
    }
}
