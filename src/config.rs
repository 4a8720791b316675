//! Runtime configuration aggregated from CLI flags.
use std::path::PathBuf;
use std::time::Duration;

/// Tunables threaded through the indexer, fetcher, content cache, and
/// overlay composer. Built once by `main.rs` from parsed CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Distance, in uncompressed MiB, between recorded gzip checkpoints.
    pub checkpoint_mib: u64,
    /// Worker threads used to stream layers concurrently while indexing.
    pub layer_concurrency: usize,
    /// Directory holding the decompressed-layer cache (`fetcher.rs`).
    pub layer_cache_dir: PathBuf,
    /// Directory holding the optional per-file content cache.
    pub content_cache_dir: PathBuf,
    /// Whether the content-cache mediator is consulted on reads.
    pub content_cache_enabled: bool,
    /// Base directory under which read-only mounts are placed
    /// (`<base>/mnts/<image_key>/ro`).
    pub mount_base_dir: PathBuf,
    /// Base directory for overlay `upper`/`work` directories
    /// (`<base>/upper/<cid>`, `<base>/work/<cid>`).
    pub rootfs_base_dir: PathBuf,
    /// Per-request timeout for registry HTTP calls.
    pub registry_timeout: Duration,
    /// Retry attempts for transient (connection-level) registry failures.
    pub registry_retries: u32,
    /// Extra FUSE mount options (passed through to `fuser::mount2`).
    pub fuse_options: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = std::env::var("XDG_STATE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("clip-fs"));
        Self {
            checkpoint_mib: crate::gzip_index::DEFAULT_INTERVAL_MIB,
            layer_concurrency: 4,
            layer_cache_dir: state_dir.join("layers"),
            content_cache_dir: state_dir.join("content"),
            content_cache_enabled: true,
            mount_base_dir: state_dir.join("mnts"),
            rootfs_base_dir: state_dir.join("rootfs"),
            registry_timeout: Duration::from_secs(30),
            registry_retries: 1,
            fuse_options: Vec::new(),
        }
    }
}
