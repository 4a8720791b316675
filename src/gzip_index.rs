//! Zran-style random-access index over a gzip-compressed stream.
//!
//! Records `(compressed-offset, uncompressed-offset)` checkpoints while a
//! layer is streamed once during indexing, so a later read can start a
//! range-GET near the byte it actually wants instead of re-inflating the
//! layer from the start.
use serde::{Deserialize, Serialize};
use std::io::{self, Read};

/// One `(compressed-offset, uncompressed-offset)` checkpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub c_off: u64,
    pub u_off: u64,
}

/// Default distance, in uncompressed bytes, between recorded checkpoints.
pub const DEFAULT_INTERVAL_MIB: u64 = 2;

/// Ascending checkpoint table for one layer.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GzipIndex {
    checkpoints: Vec<Checkpoint>,
}

impl GzipIndex {
    pub fn new() -> Self {
        Self {
            checkpoints: Vec::new(),
        }
    }

    pub fn push(&mut self, cp: Checkpoint) {
        self.checkpoints.push(cp);
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Largest checkpoint with `u_off <= want_u`, or `(0, 0)` if the table
    /// is empty or every checkpoint is past `want_u`.
    pub fn consult(&self, want_u: u64) -> Checkpoint {
        match self
            .checkpoints
            .partition_point(|cp| cp.u_off <= want_u)
        {
            0 => Checkpoint { c_off: 0, u_off: 0 },
            n => self.checkpoints[n - 1],
        }
    }

    /// `true` iff `c_off` and `u_off` are each strictly ascending across the
    /// table (one of the testable properties in the design).
    pub fn is_monotonic(&self) -> bool {
        self.checkpoints
            .windows(2)
            .all(|w| w[0].c_off < w[1].c_off && w[0].u_off < w[1].u_off)
    }
}

/// Builds a [`GzipIndex`] while a layer is streamed exactly once.
///
/// The caller must call [`Builder::maybe_checkpoint`] only at tar-entry
/// boundaries: emitting a checkpoint mid-file-body would not be a valid
/// restart point for a fresh `GzDecoder` fed from that byte onward.
pub struct Builder {
    index: GzipIndex,
    interval: u64,
    last_checkpoint_u: u64,
}

impl Builder {
    pub fn new(interval_mib: u64) -> Self {
        Self {
            index: GzipIndex::new(),
            interval: interval_mib.max(1) * 1024 * 1024,
            last_checkpoint_u: 0,
        }
    }

    /// Record a checkpoint if at least `interval` uncompressed bytes have
    /// passed since the last one.
    pub fn maybe_checkpoint(&mut self, c_off: u64, u_off: u64) {
        if self.index.is_empty() || u_off - self.last_checkpoint_u >= self.interval {
            self.index.push(Checkpoint { c_off, u_off });
            self.last_checkpoint_u = u_off;
        }
    }

    /// Append the mandatory end-of-stream checkpoint and return the table.
    pub fn finish(mut self, final_c_off: u64, final_u_off: u64) -> GzipIndex {
        self.index.push(Checkpoint {
            c_off: final_c_off,
            u_off: final_u_off,
        });
        self.index
    }
}

/// A [`Read`] wrapper that counts bytes yielded through it.
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consult_empty_returns_origin() {
        let idx = GzipIndex::new();
        assert_eq!(idx.consult(12345), Checkpoint { c_off: 0, u_off: 0 });
    }

    #[test]
    fn consult_finds_largest_not_exceeding() {
        let mut idx = GzipIndex::new();
        idx.push(Checkpoint { c_off: 0, u_off: 0 });
        idx.push(Checkpoint { c_off: 100, u_off: 2_000_000 });
        idx.push(Checkpoint { c_off: 200, u_off: 4_000_000 });
        assert_eq!(idx.consult(3_000_000), Checkpoint { c_off: 100, u_off: 2_000_000 });
        assert_eq!(idx.consult(0), Checkpoint { c_off: 0, u_off: 0 });
        assert_eq!(idx.consult(10_000_000), Checkpoint { c_off: 200, u_off: 4_000_000 });
    }

    #[test]
    fn builder_respects_interval_and_always_appends_final() {
        let mut b = Builder::new(1); // 1 MiB
        b.maybe_checkpoint(0, 0);
        b.maybe_checkpoint(10, 500_000); // below interval, skipped
        b.maybe_checkpoint(20, 1_100_000); // crosses interval
        let idx = b.finish(30, 1_500_000);
        assert!(idx.is_monotonic());
        assert_eq!(idx.len(), 3);
    }

    #[test]
    fn counting_reader_tracks_bytes_read() {
        let data = vec![1u8; 4096];
        let mut r = CountingReader::new(&data[..]);
        let mut buf = [0u8; 1024];
        r.read(&mut buf).unwrap();
        r.read(&mut buf).unwrap();
        assert_eq!(r.count(), 2048);
    }
}
