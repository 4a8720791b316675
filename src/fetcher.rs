//! Layer fetcher and decompressor: the one blocking point reads pass
//! through to resolve a node's `RemoteRef` into bytes.
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::read::GzDecoder;

use crate::error::{ClipError, Result};
use crate::gzip_index::GzipIndex;
use crate::hash::HashingWriter;
use crate::oci::registry::RegistryClient;

/// Reads narrower than this skip the full-layer cache population and take
/// the partial-range fast path instead.
const PARTIAL_RANGE_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Serves byte ranges of a decompressed layer, backed by a content-addressed
/// on-disk cache keyed by the layer's decompressed SHA-256.
pub struct LayerFetcher {
    registry: Arc<dyn RegistryClient>,
    cache_dir: PathBuf,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LayerFetcher {
    pub fn new(registry: Arc<dyn RegistryClient>, cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            registry,
            cache_dir,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    fn cache_path(&self, decompressed_hash: &str) -> PathBuf {
        self.cache_dir.join(decompressed_hash)
    }

    /// Single-flight lock for a layer digest: concurrent callers downloading
    /// the same layer block on the same `Mutex` rather than each starting a
    /// redundant download.
    fn in_flight_lock(&self, layer_digest: &str) -> Arc<Mutex<()>> {
        let mut map = self.in_flight.lock().unwrap();
        map.entry(layer_digest.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read up to `buf.len()` bytes of a file whose content starts at
    /// `u_offset` (plus the caller's own `offset`) within `layer_digest`'s
    /// decompressed tar stream, clipped to `u_length`.
    #[allow(clippy::too_many_arguments)]
    pub fn read_range(
        &self,
        repository: &str,
        layer_digest: &str,
        gzip_index: &GzipIndex,
        decompressed_hash: &str,
        u_offset: u64,
        u_length: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= u_length {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(u_length - offset) as usize;
        let want_u = u_offset + offset;

        let cache_path = self.cache_path(decompressed_hash);
        if cache_path.exists() {
            return read_from_cache(&cache_path, want_u, &mut buf[..want]);
        }

        if (want as u64) < PARTIAL_RANGE_THRESHOLD {
            if let Some(n) = self.try_partial_range(
                repository,
                layer_digest,
                gzip_index,
                want_u,
                &mut buf[..want],
            )? {
                return Ok(n);
            }
        }

        self.populate_cache(repository, layer_digest, decompressed_hash)?;
        read_from_cache(&cache_path, want_u, &mut buf[..want])
    }

    /// Range-GET from the nearest gzip checkpoint, inflate, discard the
    /// bytes before `want_u`, and fill `buf`. Never touches the cache.
    fn try_partial_range(
        &self,
        repository: &str,
        layer_digest: &str,
        gzip_index: &GzipIndex,
        want_u: u64,
        buf: &mut [u8],
    ) -> Result<Option<usize>> {
        if gzip_index.is_empty() {
            return Ok(None);
        }
        let checkpoint = gzip_index.consult(want_u);
        let blob_len = self.registry.blob_len(repository, layer_digest)?;
        if checkpoint.c_off >= blob_len {
            return Err(ClipError::RangeUnsatisfiable);
        }
        log::debug!(
            "partial-range fetch for layer {layer_digest}: checkpoint c_off={}, u_off={}",
            checkpoint.c_off,
            checkpoint.u_off
        );
        let compressed = self.registry.blob_range(
            repository,
            layer_digest,
            Some((checkpoint.c_off, blob_len - 1)),
        )?;
        let mut gz = GzDecoder::new(compressed);

        let mut to_discard = want_u - checkpoint.u_off;
        let mut sink = [0u8; 8192];
        while to_discard > 0 {
            let chunk = to_discard.min(sink.len() as u64) as usize;
            let n = gz
                .read(&mut sink[..chunk])
                .map_err(|e| ClipError::DecompressionError(e.to_string()))?;
            if n == 0 {
                return Err(ClipError::RangeUnsatisfiable);
            }
            to_discard -= n as u64;
        }

        let mut filled = 0;
        while filled < buf.len() {
            let n = gz
                .read(&mut buf[filled..])
                .map_err(|e| ClipError::DecompressionError(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(Some(filled))
    }

    /// Stream the entire layer once, inflate, and atomically populate the
    /// decompressed-content cache -- but only once, via single-flight.
    ///
    /// A network failure mid-fetch, a decompression error, or a hash
    /// mismatch against the expected decompressed digest is retried once
    /// (no cache entry is ever persisted until the digest checks out, so a
    /// mismatch needs no separate delete step) before surfacing the error.
    fn populate_cache(&self, repository: &str, layer_digest: &str, decompressed_hash: &str) -> Result<()> {
        let cache_path = self.cache_path(decompressed_hash);
        if cache_path.exists() {
            return Ok(());
        }
        let lock = self.in_flight_lock(layer_digest);
        let _guard = lock.lock().unwrap();
        if cache_path.exists() {
            return Ok(());
        }

        match self.try_populate_cache_once(repository, layer_digest, decompressed_hash, &cache_path) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("layer {layer_digest} fetch failed ({e}), retrying once");
                self.try_populate_cache_once(repository, layer_digest, decompressed_hash, &cache_path)
            }
        }
    }

    fn try_populate_cache_once(
        &self,
        repository: &str,
        layer_digest: &str,
        decompressed_hash: &str,
        cache_path: &Path,
    ) -> Result<()> {
        log::debug!("cache miss, downloading layer {layer_digest}");
        let compressed = self.registry.blob_range(repository, layer_digest, None)?;
        let gz = GzDecoder::new(compressed);

        let tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        let mut writer = HashingWriter::new(BufWriter::new(tmp.reopen()?));
        io::copy(&mut BufReader::new(gz), &mut writer)
            .map_err(|e| ClipError::DecompressionError(e.to_string()))?;
        let actual = writer.finalize_hex();

        if actual != decompressed_hash {
            return Err(ClipError::HashMismatch {
                expected: decompressed_hash.to_string(),
                actual,
            });
        }

        tmp.persist(cache_path)
            .map_err(|e| ClipError::Io(e.error))?;
        Ok(())
    }
}

fn read_from_cache(cache_path: &Path, want_u: u64, buf: &mut [u8]) -> Result<usize> {
    let mut f = File::open(cache_path)?;
    f.seek(SeekFrom::Start(want_u))?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = f.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gzip_index::Checkpoint;
    use std::io::Write as _;

    #[test]
    fn read_from_cache_clips_at_file_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer");
        std::fs::write(&path, b"hello world").unwrap();
        let mut buf = [0u8; 100];
        let n = read_from_cache(&path, 6, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn read_from_cache_returns_zero_past_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer");
        std::fs::write(&path, b"short").unwrap();
        let mut buf = [0u8; 10];
        let n = read_from_cache(&path, 100, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn gzip_index_consult_used_by_partial_range_picks_nearest_checkpoint() {
        let mut idx = GzipIndex::new();
        idx.push(Checkpoint { c_off: 0, u_off: 0 });
        idx.push(Checkpoint {
            c_off: 1000,
            u_off: 2_000_000,
        });
        assert_eq!(idx.consult(2_500_000).u_off, 2_000_000);
    }

    #[allow(dead_code)]
    fn silence_unused_write_import(mut w: impl Write) {
        let _ = w.write(b"");
    }
}
