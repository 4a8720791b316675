//! Turns a remote OCI image into a populated [`Index`](crate::node::Index)
//! plus the gzip-checkpoint tables and decompressed-hash map stored in
//! [`OciStorageInfo`](crate::archive::OciStorageInfo).
//!
//! Grounded in the teacher's `tar.rs` streaming parse loop, generalized from
//! "one local tar file" to "N remote gzip-compressed layers applied in
//! sequence with whiteout semantics" the way a union filesystem would.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use flate2::read::GzDecoder;

use crate::archive::{Archive, ImageMetadata, OciStorageInfo, StorageInfo};
use crate::error::{ClipError, Result};
use crate::gzip_index::{Builder as GzipIndexBuilder, CountingReader, GzipIndex};
use crate::hash::StreamHasher;
use crate::node::{clean_path, inode_for, parent_of, Attr, Index, Kind, Node, RemoteRef};
use crate::oci::credentials::CredentialProvider;
use crate::oci::manifest::{
    ImageConfigJson, ImageReference, ManifestResponse, MEDIA_TYPE_DOCKER_LAYER_GZIP,
    MEDIA_TYPE_OCI_LAYER_GZIP,
};
use crate::oci::registry::RegistryClient;
use crate::tar_format::TarReader;

/// Tunables for [`index_image`].
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    pub checkpoint_mib: u64,
    pub layer_concurrency: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            checkpoint_mib: crate::gzip_index::DEFAULT_INTERVAL_MIB,
            layer_concurrency: 4,
        }
    }
}

/// Per-layer result produced independently by a worker thread, with no
/// shared mutable state, merged into the aggregate index on the calling
/// thread strictly in manifest order.
struct LayerResult {
    digest: String,
    index_delta: Vec<LayerOp>,
    gzip_index: GzipIndex,
    decompressed_hash: String,
}

/// A single node-tree mutation recorded while streaming one layer. Deferred
/// rather than applied directly to a shared `Index`, since layers are
/// parsed concurrently but must be merged in manifest order.
enum LayerOp {
    Upsert(Node),
    DeletePrefix(String),
    HardLink { path: String, target: String },
}

fn is_supported_layer_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_DOCKER_LAYER_GZIP || media_type == MEDIA_TYPE_OCI_LAYER_GZIP
}

#[derive(Default)]
struct Counters {
    c_off: Cell<u64>,
    u_off: Cell<u64>,
}

/// Gzip decoder wrapper that tracks compressed/uncompressed byte counts via
/// a shared [`Counters`] (so the caller can read live offsets while a
/// [`TarReader`] holds this by value) and feeds every decompressed byte
/// through a rolling SHA-256.
///
/// `c_off` is "bytes of compressed input consumed so far", not a true gzip
/// member boundary -- the random-access scheme this system implements is
/// the simplified one described in the design (restart a fresh decoder at
/// a recorded offset), not full zran raw-deflate window recovery.
struct CountingGzip {
    inner: GzDecoder<CountingReader<Box<dyn Read + Send>>>,
    counters: Rc<Counters>,
    hasher: Rc<RefCell<StreamHasher>>,
}

impl Read for CountingGzip {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.borrow_mut().update(&buf[..n]);
        }
        self.counters.u_off.set(self.counters.u_off.get() + n as u64);
        self.counters.c_off.set(self.inner.get_ref().count());
        Ok(n)
    }
}

fn dir_node(seed: &str, path: &str, mode: u32, mtime: i64, uid: u32, gid: u32) -> Node {
    Node {
        path: path.to_string(),
        kind: Kind::Dir,
        attr: Attr {
            ino: inode_for(seed, path),
            size: 0,
            mode: mode | libc::S_IFDIR as u32,
            mtime,
            atime: mtime,
            ctime: mtime,
            uid,
            gid,
            nlink: 2,
        },
        target: None,
        remote: None,
        content_hash: None,
    }
}

/// Record `Upsert` ops for any ancestor directories `scratch.ensure_parents`
/// just synthesized, walking up until an already-recorded directory is hit.
fn ensure_parent_ops(ops: &mut Vec<LayerOp>, scratch: &Index, path: &str) {
    let mut cur = parent_of(path);
    loop {
        // Root is seeded once with ino 1 in `index_image` and must never be
        // overwritten by a layer's synthesized "/" node.
        if cur == "/" {
            break;
        }
        if let Some(node) = scratch.get(&cur) {
            if node.is_dir() {
                ops.push(LayerOp::Upsert(node.clone()));
            }
        }
        let next = parent_of(&cur);
        if next == cur {
            break;
        }
        cur = next;
    }
}

/// Stream one layer: gzip-decode, tar-parse, and build its `(nodes,
/// gzip_index, decompressed_hash)` triple. Runs on a worker thread with no
/// access to the shared index.
fn index_one_layer(
    registry: &dyn RegistryClient,
    repository: &str,
    digest: &str,
    checkpoint_mib: u64,
) -> Result<LayerResult> {
    let compressed = registry.blob_range(repository, digest, None)?;
    let counting = CountingReader::new(compressed);
    let gz_inner = GzDecoder::new(counting);

    let counters = Rc::new(Counters::default());
    let hasher_cell = Rc::new(RefCell::new(StreamHasher::new()));
    let counted = CountingGzip {
        inner: gz_inner,
        counters: counters.clone(),
        hasher: hasher_cell.clone(),
    };

    let mut ops = Vec::new();
    let mut builder = GzipIndexBuilder::new(checkpoint_mib);
    // A private scratch index lets whiteout/opaque-whiteout application and
    // `ensure_parents` reuse the exact same algorithms as the merged index,
    // even though this layer's nodes are replayed as `LayerOp`s afterward.
    let mut scratch = Index::new();

    let mut reader = TarReader::new(counted);

    loop {
        let c_off_before = counters.c_off.get();
        let u_off_before = counters.u_off.get();

        let entry = match reader.next_entry()? {
            Some(e) => e,
            None => break,
        };
        // Checkpoints land at tar-entry boundaries only, per the gzip index
        // builder's contract.
        builder.maybe_checkpoint(c_off_before, u_off_before);

        let data_start = counters.u_off.get();
        let path = clean_path(&entry.path);

        if path == "/proc" || path == "/sys" || path == "/dev" {
            reader.skip_body(entry.rsize())?;
            continue;
        }

        let base_name = path.rsplit('/').next().unwrap_or("");
        let dir = parent_of(&path);

        if base_name == ".wh..wh..opq" {
            ops.push(LayerOp::DeletePrefix(dir.clone()));
            scratch.delete_prefix(&dir);
            reader.skip_body(entry.rsize())?;
            continue;
        }
        if let Some(victim) = base_name.strip_prefix(".wh.") {
            let victim_path = if dir == "/" {
                format!("/{victim}")
            } else {
                format!("{dir}/{victim}")
            };
            ops.push(LayerOp::DeletePrefix(victim_path.clone()));
            scratch.delete_prefix(&victim_path);
            reader.skip_body(entry.rsize())?;
            continue;
        }

        scratch.ensure_parents(&path, entry.mtime, digest);
        ensure_parent_ops(&mut ops, &scratch, &path);

        match entry.typeflag {
            b'5' => {
                let node = dir_node(digest, &path, entry.mode, entry.mtime, entry.uid, entry.gid);
                scratch.set(node.clone());
                ops.push(LayerOp::Upsert(node));
                reader.skip_body(entry.rsize())?;
            }
            b'0' | b'\0' | b'7' => {
                let node = Node {
                    path: path.clone(),
                    kind: Kind::File,
                    attr: Attr {
                        ino: inode_for(digest, &path),
                        size: entry.size,
                        mode: entry.mode | libc::S_IFREG as u32,
                        mtime: entry.mtime,
                        atime: entry.mtime,
                        ctime: entry.mtime,
                        uid: entry.uid,
                        gid: entry.gid,
                        nlink: 1,
                    },
                    target: None,
                    remote: Some(RemoteRef {
                        layer_digest: digest.to_string(),
                        u_offset: data_start,
                        u_length: entry.size,
                    }),
                    content_hash: Some(crate::hash::content_hash(digest, &path)),
                };
                scratch.set(node.clone());
                ops.push(LayerOp::Upsert(node));
                reader.skip_body(entry.rsize())?;
            }
            b'2' => {
                let target = entry.link_target.clone().unwrap_or_default();
                let node = Node {
                    path: path.clone(),
                    kind: Kind::Symlink,
                    attr: Attr {
                        ino: inode_for(digest, &path),
                        size: target.len() as u64,
                        mode: 0o777 | libc::S_IFLNK as u32,
                        mtime: entry.mtime,
                        atime: entry.mtime,
                        ctime: entry.mtime,
                        uid: entry.uid,
                        gid: entry.gid,
                        nlink: 1,
                    },
                    target: Some(target),
                    remote: None,
                    content_hash: None,
                };
                scratch.set(node.clone());
                ops.push(LayerOp::Upsert(node));
                reader.skip_body(entry.rsize())?;
            }
            b'1' => {
                // Hard link: resolved against the merged index (the target
                // may live in a lower layer), so only the intent is
                // recorded here; the merge step performs the lookup.
                if let Some(target) = entry.link_target.clone() {
                    ops.push(LayerOp::HardLink {
                        path: path.clone(),
                        target: clean_path(&target),
                    });
                }
                reader.skip_body(entry.rsize())?;
            }
            _ => {
                // device, fifo, socket: not representable, skip.
                reader.skip_body(entry.rsize())?;
            }
        }
    }

    let mut counted = reader.into_inner();
    // Drain any trailing padding the tar parser didn't consume so the
    // decompressed hash covers the entire layer, matching how its digest
    // was originally computed.
    let mut sink = [0u8; 8192];
    loop {
        match counted.read(&mut sink) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) => return Err(ClipError::DecompressionError(e.to_string())),
        }
    }
    let final_c_off = counters.c_off.get();
    let final_u_off = counters.u_off.get();
    drop(counted);

    let decompressed_hash = Rc::try_unwrap(hasher_cell)
        .map_err(|_| ())
        .expect("layer worker retains sole owner of its hasher after streaming")
        .into_inner()
        .finalize_hex();

    Ok(LayerResult {
        digest: digest.to_string(),
        index_delta: ops,
        gzip_index: builder.finish(final_c_off, final_u_off),
        decompressed_hash,
    })
}

/// Fetch the manifest, resolving one level of manifest-list indirection for
/// `linux/amd64` (the only platform this system targets today).
fn resolve_manifest(
    registry: &dyn RegistryClient,
    repository: &str,
    reference: &str,
) -> Result<crate::oci::manifest::ImageManifest> {
    let (media_type, body) = registry.manifest(repository, reference)?;
    let response = ManifestResponse::parse(&media_type, &body)?;
    if let Some(digest) = response.digest_for_platform("amd64", "linux")? {
        let (media_type, body) = registry.manifest(repository, &digest)?;
        ManifestResponse::parse(&media_type, &body)?.into_manifest()
    } else {
        response.into_manifest()
    }
}

fn fetch_image_config(
    registry: &dyn RegistryClient,
    repository: &str,
    digest: &str,
) -> Result<ImageConfigJson> {
    let mut reader = registry.blob_range(repository, digest, None)?;
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .map_err(|e| ClipError::RegistryUnreachable(e.to_string()))?;
    serde_json::from_slice(&buf).map_err(|e| ClipError::CorruptIndex(format!("image config: {e}")))
}

/// Build a complete [`Archive`] for `image_ref` by fetching its manifest,
/// streaming every layer (bounded by `opts.layer_concurrency` worker
/// threads, processed in manifest-order batches so merge order is never in
/// question), and merging the layers' deltas into one [`Index`].
pub fn index_image(
    image_ref: &ImageReference,
    registry: Arc<dyn RegistryClient>,
    _credentials: Arc<dyn CredentialProvider>,
    opts: IndexOptions,
) -> Result<Archive> {
    let manifest = resolve_manifest(registry.as_ref(), &image_ref.repository, &image_ref.reference)?;

    for layer in &manifest.layers {
        if !is_supported_layer_media_type(&layer.media_type) {
            log::warn!("unsupported layer media type {}", layer.media_type);
            return Err(ClipError::UnsupportedLayerMediaType(layer.media_type.clone()));
        }
    }

    let config_json = fetch_image_config(registry.as_ref(), &image_ref.repository, &manifest.config.digest)?;

    let layers: Vec<String> = manifest.layers.iter().map(|l| l.digest.clone()).collect();
    log::info!("indexing {} layers for {}", layers.len(), image_ref);

    let results = stream_layers_bounded(registry.clone(), &image_ref.repository, &layers, opts)?;

    let mut index = Index::new();
    let mut root = dir_node("root", "/", 0o755, 0, 0, 0);
    root.attr.ino = 1; // reserved for root, per the inode policy
    index.set(root);

    let mut gzip_index_by_layer = HashMap::new();
    let mut decompressed_hash_by_layer = HashMap::new();

    for result in results {
        for op in result.index_delta {
            match op {
                LayerOp::Upsert(node) => index.set(node),
                LayerOp::DeletePrefix(p) => index.delete_prefix(&p),
                LayerOp::HardLink { path, target } => {
                    if let Some(existing) = index.get(&target).cloned() {
                        index.set(Node { path, ..existing });
                    }
                }
            }
        }
        gzip_index_by_layer.insert(result.digest.clone(), result.gzip_index);
        decompressed_hash_by_layer.insert(result.digest, result.decompressed_hash);
    }

    let image_metadata: ImageMetadata = config_json.into_image_metadata();

    let storage_info = StorageInfo::Oci(OciStorageInfo {
        registry_url: image_ref.registry.clone(),
        repository: image_ref.repository.clone(),
        reference: image_ref.reference.clone(),
        layers,
        gzip_index_by_layer,
        decompressed_hash_by_layer,
        image_metadata: Some(image_metadata),
    });

    Ok(Archive::new(index, storage_info))
}

/// Stream layers with at most `opts.layer_concurrency` in flight at once,
/// batching the manifest's layer list into chunks of that size: each batch
/// is joined before the next is spawned, so results come back in manifest
/// order without any cross-thread ordering bookkeeping.
fn stream_layers_bounded(
    registry: Arc<dyn RegistryClient>,
    repository: &str,
    layers: &[String],
    opts: IndexOptions,
) -> Result<Vec<LayerResult>> {
    let concurrency = opts.layer_concurrency.max(1);
    let mut results = Vec::with_capacity(layers.len());

    for chunk in layers.chunks(concurrency) {
        let mut handles = Vec::with_capacity(chunk.len());
        for digest in chunk {
            let registry = registry.clone();
            let repository = repository.to_string();
            let digest = digest.clone();
            let checkpoint_mib = opts.checkpoint_mib;
            handles.push(thread::spawn(move || {
                index_one_layer(registry.as_ref(), &repository, &digest, checkpoint_mib)
            }));
        }
        for handle in handles {
            let result = handle.join().expect("layer indexing thread panicked")?;
            results.push(result);
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_options_default_matches_design_defaults() {
        let opts = IndexOptions::default();
        assert_eq!(opts.checkpoint_mib, crate::gzip_index::DEFAULT_INTERVAL_MIB);
        assert_eq!(opts.layer_concurrency, 4);
    }

    #[test]
    fn supported_layer_media_types() {
        assert!(is_supported_layer_media_type(MEDIA_TYPE_DOCKER_LAYER_GZIP));
        assert!(is_supported_layer_media_type(MEDIA_TYPE_OCI_LAYER_GZIP));
        assert!(!is_supported_layer_media_type(
            "application/vnd.oci.image.layer.v1.tar+zstd"
        ));
    }
}
