//! `clip` -- a lazy-loading rootfs filesystem for OCI container images.
//!
//! Three subcommands, matching the three lifecycle stages of a mounted
//! image:
//!
//! ```bash
//! $ clip index --image alpine:3.18 --out alpine.clip
//! $ clip mount --clip alpine.clip --cid demo
//! /var/lib/clip-fs/demo/rootfs
//! $ clip umount --cid demo
//! ```
//!
//! `index` resolves a manifest from a registry and streams every layer once
//! to build a `.clip` archive (see [`archive`]) without ever materializing a
//! full extracted copy of the image on disk. `mount` starts a FUSE
//! filesystem over that archive's read-only root and composes it with a
//! per-container writable overlay. `umount` tears the overlay and FUSE mount
//! back down.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod archive;
mod config;
mod content_cache;
mod error;
mod fetcher;
mod fs;
mod gzip_index;
mod hash;
mod node;
mod oci;
mod overlay;
mod tar_format;

use archive::{Archive, StorageInfo};
use config::Config;
use content_cache::ContentCache;
use fetcher::LayerFetcher;
use oci::{
    index_image, AnonymousCredentialProvider, CredentialProvider, HttpRegistryClient,
    ImageReference, StaticCredentialProvider,
};
use oci::indexer::IndexOptions;
use overlay::OverlayComposer;

/// Lazy-loading rootfs filesystem for OCI container images.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a `.clip` archive from a remote OCI image.
    Index {
        /// Image reference, e.g. `alpine:3.18` or `docker.io/library/alpine@sha256:...`.
        #[clap(long)]
        image: String,

        /// Output path for the `.clip` archive.
        #[clap(long)]
        out: PathBuf,

        /// Distance, in uncompressed MiB, between gzip random-access checkpoints.
        #[clap(long)]
        checkpoint_mib: Option<u64>,

        /// Number of layers streamed concurrently while indexing.
        #[clap(long)]
        layer_concurrency: Option<usize>,

        /// Registry username, for private images.
        #[clap(long, requires = "password")]
        username: Option<String>,

        /// Registry password, for private images.
        #[clap(long, requires = "username")]
        password: Option<String>,
    },

    /// Mount a `.clip` archive as a container rootfs.
    Mount {
        /// Path to the `.clip` archive.
        #[clap(long)]
        clip: PathBuf,

        /// Container id; scopes the overlay's upper/work directories.
        #[clap(long)]
        cid: String,

        #[clap(long)]
        mount_base: Option<PathBuf>,

        #[clap(long)]
        rootfs_base: Option<PathBuf>,

        #[clap(long)]
        layer_cache: Option<PathBuf>,

        #[clap(long)]
        content_cache: Option<PathBuf>,

        /// Stay attached to the terminal instead of forking to the background.
        #[clap(long)]
        foreground: bool,
    },

    /// Unmount and clean up a previously mounted container rootfs.
    Umount {
        #[clap(long)]
        cid: String,

        #[clap(long)]
        mount_base: Option<PathBuf>,

        #[clap(long)]
        rootfs_base: Option<PathBuf>,
    },
}

fn run_index(
    image: String,
    out: PathBuf,
    checkpoint_mib: Option<u64>,
    layer_concurrency: Option<usize>,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let cfg = Config::default();
    let image_ref = ImageReference::parse(&image).context("parsing image reference")?;

    let credentials: Arc<dyn CredentialProvider> = match (username, password) {
        (Some(u), Some(p)) => {
            Arc::new(StaticCredentialProvider::new().with(image_ref.registry.as_str(), u, p))
        }
        _ => Arc::new(AnonymousCredentialProvider),
    };

    let registry: Arc<dyn oci::RegistryClient> = Arc::new(HttpRegistryClient::new(
        &image_ref.registry,
        credentials.clone(),
        cfg.registry_timeout,
    ));

    let opts = IndexOptions {
        checkpoint_mib: checkpoint_mib.unwrap_or(cfg.checkpoint_mib),
        layer_concurrency: layer_concurrency.unwrap_or(cfg.layer_concurrency),
    };

    let archive = index_image(&image_ref, registry, credentials, opts)
        .with_context(|| format!("indexing image {image}"))?;
    let written = archive.write_to_file(&out)?;
    log::info!(
        "wrote {} ({} nodes, {written} bytes)",
        out.display(),
        archive.index.len()
    );
    Ok(())
}

fn run_mount(
    clip: PathBuf,
    cid: String,
    mount_base: Option<PathBuf>,
    rootfs_base: Option<PathBuf>,
    layer_cache: Option<PathBuf>,
    content_cache_dir: Option<PathBuf>,
    foreground: bool,
) -> Result<()> {
    let cfg = Config::default();
    let mount_base_dir = mount_base.unwrap_or(cfg.mount_base_dir);
    let rootfs_base_dir = rootfs_base.unwrap_or(cfg.rootfs_base_dir);
    let layer_cache_dir = layer_cache.unwrap_or(cfg.layer_cache_dir);
    let content_cache_dir = content_cache_dir.unwrap_or(cfg.content_cache_dir);

    let archive = Archive::read_from_file(&clip).with_context(|| format!("reading {}", clip.display()))?;
    let StorageInfo::Oci(storage_info) = archive.storage_info;

    let mut image_key_hasher = hash::StreamHasher::new();
    image_key_hasher.update(storage_info.repository.as_bytes());
    image_key_hasher.update(b"@");
    image_key_hasher.update(storage_info.reference.as_bytes());
    let image_key = image_key_hasher.finalize_hex();
    let ro_root = mount_base_dir.join(&image_key).join("ro");
    std::fs::create_dir_all(&ro_root)?;

    let credentials: Arc<dyn CredentialProvider> = Arc::new(AnonymousCredentialProvider);
    let registry: Arc<dyn oci::RegistryClient> = Arc::new(HttpRegistryClient::new(
        &storage_info.registry_url,
        credentials,
        cfg.registry_timeout,
    ));
    let fetcher = Arc::new(LayerFetcher::new(registry, layer_cache_dir)?);
    let content_cache = Arc::new(ContentCache::new(content_cache_dir, cfg.content_cache_enabled)?);

    let clip_fs = fs::ClipFilesystem::new(archive.index, storage_info, fetcher, content_cache);
    let ro_root_str = ro_root.to_string_lossy().to_string();

    // `spawn_mount2` runs the FUSE session on its own thread and unmounts
    // on drop, so `_session` must outlive the overlay composition below.
    let _session = fs::mount(clip_fs, &ro_root_str, &cfg.fuse_options)?;

    let composer = OverlayComposer::new(rootfs_base_dir);
    let rootfs = composer.mount(&cid, &ro_root)?;
    println!("{}", rootfs.display());

    if foreground {
        log::info!("serving container {cid} in the foreground; Ctrl-C to stop");
    } else {
        log::info!("serving container {cid}");
    }
    loop {
        std::thread::park();
    }
}

/// `--mount-base` is accepted for symmetry with `mount` but unused: the
/// read-only root is keyed by image, not by container, and outlives any
/// single container's lifecycle.
fn run_umount(cid: String, _mount_base: Option<PathBuf>, rootfs_base: Option<PathBuf>) -> Result<()> {
    let cfg = Config::default();
    let rootfs_base_dir = rootfs_base.unwrap_or(cfg.rootfs_base_dir);
    let composer = OverlayComposer::new(rootfs_base_dir);
    composer.unmount(&cid)?;
    log::info!("unmounted container {cid}");
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Index {
            image,
            out,
            checkpoint_mib,
            layer_concurrency,
            username,
            password,
        } => run_index(image, out, checkpoint_mib, layer_concurrency, username, password),
        Commands::Mount {
            clip,
            cid,
            mount_base,
            rootfs_base,
            layer_cache,
            content_cache,
            foreground,
        } => run_mount(clip, cid, mount_base, rootfs_base, layer_cache, content_cache, foreground),
        Commands::Umount {
            cid,
            mount_base,
            rootfs_base,
        } => run_umount(cid, mount_base, rootfs_base),
    };

    if let Err(e) = &result {
        log::error!("{e:#}");
        std::process::exit(2);
    }
    result
}
