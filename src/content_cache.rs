//! Optional per-file content-cache mediator sitting in front of the layer
//! fetcher: once a file has been read once, later reads (by any container
//! sharing the same base image) are served from a local cache keyed by the
//! file's stable `content_hash` instead of re-consulting the registry.
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Buffer size used when copying a freshly-fetched file into the cache.
const CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// Tracks content hashes currently being populated so concurrent misses for
/// the same file coalesce into one write instead of racing each other.
#[derive(Default)]
struct InProgress {
    hashes: Mutex<HashSet<String>>,
}

impl InProgress {
    fn begin(&self, hash: &str) -> bool {
        self.hashes.lock().unwrap().insert(hash.to_string())
    }

    fn finish(&self, hash: &str) {
        self.hashes.lock().unwrap().remove(hash);
    }
}

/// Optional content-cache mediator. When disabled, `get` always misses and
/// `store` is a no-op, so callers can treat it uniformly either way.
pub struct ContentCache {
    dir: PathBuf,
    enabled: bool,
    in_progress: Arc<InProgress>,
}

impl ContentCache {
    pub fn new(dir: PathBuf, enabled: bool) -> Result<Self> {
        if enabled {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            dir,
            enabled,
            in_progress: Arc::new(InProgress::default()),
        })
    }

    fn path_for(&self, content_hash: &str) -> PathBuf {
        self.dir.join(content_hash)
    }

    /// Serve `length` bytes at `offset` from the cache, if present.
    pub fn get(&self, content_hash: &str, offset: u64, length: usize, buf: &mut [u8]) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        let path = self.path_for(content_hash);
        let mut f = File::open(path).ok()?;
        f.seek(SeekFrom::Start(offset)).ok()?;
        let want = length.min(buf.len());
        let mut filled = 0;
        while filled < want {
            match f.read(&mut buf[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(_) => return None,
            }
        }
        Some(filled)
    }

    /// Populate the cache for `content_hash` from `source`, skipping the
    /// copy entirely if another thread is already populating the same hash
    /// (single-flight) or the cache is disabled. Errors are logged, not
    /// propagated: a failed cache population must never fail the read that
    /// triggered it.
    pub fn store(&self, content_hash: &str, mut source: impl Read) {
        if !self.enabled {
            return;
        }
        if !self.in_progress.begin(content_hash) {
            return;
        }
        let in_progress = self.in_progress.clone();
        let content_hash = content_hash.to_string();
        let path = self.path_for(&content_hash);
        let dir = self.dir.clone();

        let result = (|| -> io::Result<()> {
            let tmp = tempfile::NamedTempFile::new_in(&dir)?;
            let mut writer = BufWriter::new(tmp.reopen()?);
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = source.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n])?;
            }
            writer.flush()?;
            drop(writer);
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })();

        if let Err(e) = result {
            log::warn!("content-cache population failed for {content_hash}: {e}");
        }
        in_progress.finish(&content_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_cache_always_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), false).unwrap();
        cache.store("abc", &b"hello"[..]);
        let mut buf = [0u8; 10];
        assert!(cache.get("abc", 0, 5, &mut buf).is_none());
    }

    #[test]
    fn store_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), true).unwrap();
        cache.store("hash1", &b"hello world"[..]);
        let mut buf = [0u8; 5];
        let n = cache.get("hash1", 6, 5, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn get_misses_for_unknown_hash() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), true).unwrap();
        let mut buf = [0u8; 4];
        assert!(cache.get("nope", 0, 4, &mut buf).is_none());
    }
}
