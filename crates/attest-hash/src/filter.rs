//! Content filters applied between the raw version stream and the digests.

use attest_core::ResourceId;
use attest_store::VersionStream;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Rewrites a version's raw stream before it is digested.
pub trait ContentFilter: Send + Sync {
    fn filter(&self, resource: &ResourceId, raw: VersionStream) -> VersionStream;
}

/// Collapses every run of ASCII whitespace to a single space.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceFilter;

impl ContentFilter for WhitespaceFilter {
    fn filter(&self, _resource: &ResourceId, raw: VersionStream) -> VersionStream {
        Box::new(CollapseWhitespace::new(raw))
    }
}

struct CollapseWhitespace<R> {
    inner: R,
    in_space: bool,
    buf: Vec<u8>,
}

impl<R: Read> CollapseWhitespace<R> {
    fn new(inner: R) -> Self {
        CollapseWhitespace {
            inner,
            in_space: false,
            buf: vec![0u8; 4096],
        }
    }
}

impl<R: Read> Read for CollapseWhitespace<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        // Output never exceeds input, so reading at most out.len() raw bytes is safe.
        // Loop because a chunk of pure whitespace after a space produces nothing.
        loop {
            let want = out.len().min(self.buf.len());
            let n = self.inner.read(&mut self.buf[..want])?;
            if n == 0 {
                return Ok(0);
            }
            let mut written = 0;
            for &b in &self.buf[..n] {
                if b.is_ascii_whitespace() {
                    if !self.in_space {
                        out[written] = b' ';
                        written += 1;
                        self.in_space = true;
                    }
                } else {
                    out[written] = b;
                    written += 1;
                    self.in_space = false;
                }
            }
            if written > 0 {
                return Ok(written);
            }
        }
    }
}

/// Counts the raw bytes pulled through it into a shared counter.
pub(crate) struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub(crate) fn new(inner: R, count: Arc<AtomicU64>) -> Self {
        CountingReader { inner, count }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}
