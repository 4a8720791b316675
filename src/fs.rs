//! Read-only FUSE filesystem serving a mounted OCI image from its node
//! index, resolving file reads through the layer fetcher and content
//! cache rather than a single backing tar file.
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEntry, ReplyOpen, Request,
};
use libc::{EINVAL, ENAMETOOLONG, ENOENT, EROFS};

use crate::archive::OciStorageInfo;
use crate::content_cache::ContentCache;
use crate::fetcher::LayerFetcher;
use crate::gzip_index::GzipIndex;
use crate::node::{Index, Kind, Node};

const MAX_NAME_LENGTH: u32 = 255;

/// Time to retain lookups for, matching libfuse's own default.
const TTL: Duration = Duration::new(1, 0);

fn to_file_type(kind: Kind) -> FileType {
    match kind {
        Kind::Dir => FileType::Directory,
        Kind::File => FileType::RegularFile,
        Kind::Symlink => FileType::Symlink,
    }
}

fn to_file_attr(node: &Node) -> FileAttr {
    let a = &node.attr;
    let size = match node.kind {
        Kind::Dir => 4096,
        Kind::Symlink => node.target.as_ref().map(|t| t.len() as u64).unwrap_or(0),
        Kind::File => a.size,
    };
    let time = |secs: i64| UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64);
    FileAttr {
        ino: a.ino,
        size,
        blocks: (size + 511) / 512,
        atime: time(a.atime),
        mtime: time(a.mtime),
        ctime: time(a.ctime),
        crtime: time(a.ctime),
        kind: to_file_type(node.kind),
        perm: (a.mode & 0o7777) as u16,
        nlink: a.nlink,
        uid: a.uid,
        gid: a.gid,
        rdev: 0,
        flags: 0,
        blksize: 4096,
    }
}

/// Streams one file's full content through the layer fetcher, for
/// fire-and-forget content-cache population after a cache-miss read.
struct RemoteFileReader {
    fetcher: Arc<LayerFetcher>,
    repository: String,
    layer_digest: String,
    gzip_index: GzipIndex,
    decompressed_hash: String,
    u_offset: u64,
    u_length: u64,
    pos: u64,
}

impl Read for RemoteFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .fetcher
            .read_range(
                &self.repository,
                &self.layer_digest,
                &self.gzip_index,
                &self.decompressed_hash,
                self.u_offset,
                self.u_length,
                self.pos,
                buf,
            )
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Read-only FUSE filesystem over a `.clip` archive's node index.
pub struct ClipFilesystem {
    index: Index,
    ino_to_path: HashMap<u64, String>,
    storage_info: OciStorageInfo,
    fetcher: Arc<LayerFetcher>,
    content_cache: Arc<ContentCache>,
    next_file_handle: AtomicU64,
}

impl ClipFilesystem {
    pub fn new(
        index: Index,
        storage_info: OciStorageInfo,
        fetcher: Arc<LayerFetcher>,
        content_cache: Arc<ContentCache>,
    ) -> Self {
        let ino_to_path = index.iter().map(|(path, node)| (node.attr.ino, path.clone())).collect();
        Self {
            index,
            ino_to_path,
            storage_info,
            fetcher,
            content_cache,
            next_file_handle: AtomicU64::new(1),
        }
    }

    fn path_of(&self, ino: u64) -> Option<&str> {
        self.ino_to_path.get(&ino).map(|s| s.as_str())
    }

    fn node_of(&self, ino: u64) -> Option<&Node> {
        self.path_of(ino).and_then(|p| self.index.get(p))
    }

    fn spawn_cache_population(&self, node: &Node) {
        let remote = match &node.remote {
            Some(r) => r.clone(),
            None => return,
        };
        let content_hash = match &node.content_hash {
            Some(h) => h.clone(),
            None => return,
        };
        let gzip_index = match self.storage_info.gzip_index_by_layer.get(&remote.layer_digest) {
            Some(g) => g.clone(),
            None => return,
        };
        let decompressed_hash = match self
            .storage_info
            .decompressed_hash_by_layer
            .get(&remote.layer_digest)
        {
            Some(h) => h.clone(),
            None => return,
        };
        let fetcher = self.fetcher.clone();
        let content_cache = self.content_cache.clone();
        let repository = self.storage_info.repository.clone();
        log::debug!("scheduling content-cache population for {content_hash}");
        thread::spawn(move || {
            let reader = RemoteFileReader {
                fetcher,
                repository,
                layer_digest: remote.layer_digest,
                gzip_index,
                decompressed_hash,
                u_offset: remote.u_offset,
                u_length: remote.u_length,
                pos: 0,
            };
            content_cache.store(&content_hash, reader);
        });
    }
}

impl Filesystem for ClipFilesystem {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if name.len() > MAX_NAME_LENGTH as usize {
            reply.error(ENAMETOOLONG);
            return;
        }
        let name = match name.to_str() {
            Some(s) => s,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let parent_path = match self.path_of(parent) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let child_path = if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        };
        match self.index.get(&child_path) {
            Some(node) => reply.entry(&TTL, &to_file_attr(node), 0),
            None => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match self.node_of(ino) {
            Some(node) => reply.attr(&TTL, &to_file_attr(node)),
            None => reply.error(ENOENT),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let path = match self.path_of(ino) {
            Some(p) => p.to_string(),
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        if offset <= 0 && reply.add(ino, 1, FileType::Directory, ".") {
            reply.ok();
            return;
        }
        let parent_ino = if path == "/" {
            ino
        } else {
            let parent_path = crate::node::parent_of(&path);
            self.index.get(&parent_path).map(|n| n.attr.ino).unwrap_or(ino)
        };
        if offset <= 1 && reply.add(parent_ino, 2, FileType::Directory, "..") {
            reply.ok();
            return;
        }

        let children = self.index.list_dir(&path);
        for (i, (name, node)) in children.into_iter().enumerate() {
            let entry_offset = (i as i64) + 3;
            if entry_offset <= offset {
                continue;
            }
            if reply.add(node.attr.ino, entry_offset, to_file_type(node.kind), &name) {
                break;
            }
        }
        reply.ok();
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.node_of(ino) {
            Some(node) if node.kind == Kind::Symlink => {
                reply.data(node.target.as_deref().unwrap_or("").as_bytes())
            }
            Some(_) => reply.error(EINVAL),
            None => reply.error(ENOENT),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        if self.node_of(ino).is_none() {
            reply.error(ENOENT);
            return;
        }
        let fh = self.next_file_handle.fetch_add(1, Ordering::Relaxed);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let node = match self.node_of(ino) {
            Some(n) if n.kind == Kind::File => n.clone(),
            Some(_) => {
                reply.error(EINVAL);
                return;
            }
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let offset = offset.max(0) as u64;
        if offset >= node.attr.size {
            reply.data(&[]);
            return;
        }

        let remote = match &node.remote {
            Some(r) => r,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let content_hash = node.content_hash.clone().unwrap_or_default();

        let mut buf = vec![0u8; size as usize];
        if let Some(n) = self.content_cache.get(&content_hash, offset, size as usize, &mut buf) {
            reply.data(&buf[..n]);
            return;
        }

        let gzip_index = self
            .storage_info
            .gzip_index_by_layer
            .get(&remote.layer_digest)
            .cloned()
            .unwrap_or_default();
        let decompressed_hash = self
            .storage_info
            .decompressed_hash_by_layer
            .get(&remote.layer_digest)
            .cloned()
            .unwrap_or_default();

        match self.fetcher.read_range(
            &self.storage_info.repository,
            &remote.layer_digest,
            &gzip_index,
            &decompressed_hash,
            remote.u_offset,
            remote.u_length,
            offset,
            &mut buf,
        ) {
            Ok(n) => {
                reply.data(&buf[..n]);
                self.spawn_cache_population(&node);
            }
            Err(e) => {
                log::warn!("read failed for {}: {e}", node.path);
                reply.error(e.to_errno());
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.node_of(_ino) {
            Some(_) => reply.error(EROFS),
            None => reply.error(ENOENT),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        reply.error(EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(EROFS);
    }

    fn unlink(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: fuser::ReplyEmpty) {
        reply.error(EROFS);
    }

    fn rmdir(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: fuser::ReplyEmpty) {
        reply.error(EROFS);
    }

    fn rename(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(EROFS);
    }

    fn create(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(EROFS);
    }
}

/// Mount a `ClipFilesystem` at `mount_point` in the background. The
/// returned [`fuser::BackgroundSession`] unmounts on drop, so the caller
/// must hold onto it for as long as the mount should stay up.
pub fn mount(
    fs: ClipFilesystem,
    mount_point: &str,
    extra_options: &[String],
) -> anyhow::Result<fuser::BackgroundSession> {
    let mut options = vec![
        MountOption::FSName("clip-fs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::RO,
        MountOption::Suid,
        MountOption::Exec,
        MountOption::NoAtime,
        MountOption::Async,
    ];
    for opt in extra_options {
        options.push(MountOption::CUSTOM(opt.clone()));
    }
    Ok(fuser::spawn_mount2(fs, mount_point, &options)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Attr, RemoteRef};

    fn dir(path: &str, ino: u64) -> Node {
        Node {
            path: path.to_string(),
            kind: Kind::Dir,
            attr: Attr {
                ino,
                size: 0,
                mode: 0o755,
                mtime: 0,
                atime: 0,
                ctime: 0,
                uid: 0,
                gid: 0,
                nlink: 2,
            },
            target: None,
            remote: None,
            content_hash: None,
        }
    }

    fn file(path: &str, ino: u64, size: u64) -> Node {
        Node {
            path: path.to_string(),
            kind: Kind::File,
            attr: Attr {
                ino,
                size,
                mode: 0o644,
                mtime: 0,
                atime: 0,
                ctime: 0,
                uid: 0,
                gid: 0,
                nlink: 1,
            },
            target: None,
            remote: Some(RemoteRef {
                layer_digest: "sha256:abc".into(),
                u_offset: 0,
                u_length: size,
            }),
            content_hash: Some("hash".into()),
        }
    }

    #[test]
    fn to_file_attr_reports_directory_size_as_4096() {
        let attr = to_file_attr(&dir("/etc", 2));
        assert_eq!(attr.size, 4096);
        assert_eq!(attr.kind, FileType::Directory);
    }

    #[test]
    fn to_file_attr_reports_real_file_size() {
        let attr = to_file_attr(&file("/etc/hostname", 9, 42));
        assert_eq!(attr.size, 42);
        assert_eq!(attr.kind, FileType::RegularFile);
    }
}
