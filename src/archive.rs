//! The `.clip` container format: fixed header, path-ordered node index, and
//! a typed storage-info blob.
//!
//! Adapted from the teacher's `Index::to_file`/`from_file` pair (plain
//! `bincode` over a `BufWriter`/`BufReader`), generalized to the three-part
//! layout the container format requires: a header written twice (once with
//! placeholder offsets, once with the real ones) bracketing two
//! independently-sized blobs.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};

use crate::error::{ClipError, Result};
use crate::gzip_index::GzipIndex;
use crate::node::Index;

pub const MAGIC: [u8; 9] = [0x89, b'C', b'L', b'I', b'P', 0x0D, 0x0A, 0x1A, 0x0A];
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: u64 = 54;
pub const OCI_STORAGE_INFO_TAG: [u8; 12] = *b"oci\0\0\0\0\0\0\0\0\0";

/// Image configuration retained from the manifest's config blob, carried
/// verbatim so runtime integration can recover it without a second fetch.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    pub architecture: String,
    pub os: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub labels: HashMap<String, String>,
    pub created: Option<String>,
}

/// Storage-info for the `"oci"` variant: everything the read path needs to
/// resolve a node's `RemoteRef` against a registry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OciStorageInfo {
    pub registry_url: String,
    pub repository: String,
    pub reference: String,
    pub layers: Vec<String>,
    pub gzip_index_by_layer: HashMap<String, GzipIndex>,
    pub decompressed_hash_by_layer: HashMap<String, String>,
    pub image_metadata: Option<ImageMetadata>,
}

/// Tagged union of storage-info variants. Only `Oci` is implemented today;
/// the 12-byte tag on the wire leaves room for more without a format change.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageInfo {
    Oci(OciStorageInfo),
}

impl StorageInfo {
    fn tag(&self) -> [u8; 12] {
        match self {
            StorageInfo::Oci(_) => OCI_STORAGE_INFO_TAG,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    index_len: u64,
    index_pos: u64,
    storage_info_len: u64,
    storage_info_pos: u64,
    storage_info_type: [u8; 12],
}

fn encode_header(h: &Header) -> [u8; HEADER_LEN as usize] {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[0..9].copy_from_slice(&MAGIC);
    buf[9] = FORMAT_VERSION;
    buf[10..18].copy_from_slice(&h.index_len.to_le_bytes());
    buf[18..26].copy_from_slice(&h.index_pos.to_le_bytes());
    buf[26..34].copy_from_slice(&h.storage_info_len.to_le_bytes());
    buf[34..42].copy_from_slice(&h.storage_info_pos.to_le_bytes());
    buf[42..54].copy_from_slice(&h.storage_info_type);
    buf
}

fn decode_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < HEADER_LEN as usize || buf[0..9] != MAGIC || buf[9] != FORMAT_VERSION {
        return Err(ClipError::HeaderMismatch);
    }
    let u64_at = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
    let mut storage_info_type = [0u8; 12];
    storage_info_type.copy_from_slice(&buf[42..54]);
    Ok(Header {
        index_len: u64_at(10),
        index_pos: u64_at(18),
        storage_info_len: u64_at(26),
        storage_info_pos: u64_at(34),
        storage_info_type,
    })
}

fn encode_storage_info(info: &StorageInfo) -> Result<Vec<u8>> {
    match info {
        StorageInfo::Oci(oci) => Ok(bincode::serialize(oci)?),
    }
}

fn decode_storage_info(tag: [u8; 12], bytes: &[u8]) -> Result<StorageInfo> {
    match tag {
        OCI_STORAGE_INFO_TAG => {
            let oci: OciStorageInfo = bincode::deserialize(bytes)
                .map_err(|e| ClipError::CorruptStorageInfo(e.to_string()))?;
            Ok(StorageInfo::Oci(oci))
        }
        other => Err(ClipError::UnsupportedStorageInfoType(other)),
    }
}

/// An in-memory archive: the node tree plus its storage-info.
#[derive(Debug, Clone)]
pub struct Archive {
    pub index: Index,
    pub storage_info: StorageInfo,
}

impl Archive {
    pub fn new(index: Index, storage_info: StorageInfo) -> Self {
        Self { index, storage_info }
    }

    /// Write this archive as a `.clip` file at `path`, overwriting any
    /// existing file. Header placement is: zero-placeholder header, index
    /// blob, storage-info blob, then the header is rewritten in place with
    /// the real offsets.
    pub fn write_to_file(&self, path: &std::path::Path) -> Result<u64> {
        let index_bytes =
            bincode::serialize(&self.index).map_err(|e| ClipError::CorruptIndex(e.to_string()))?;
        let storage_info_bytes = encode_storage_info(&self.storage_info)?;

        let file = File::create(path)?;
        let mut w = BufWriter::new(file);

        let placeholder = encode_header(&Header {
            index_len: 0,
            index_pos: 0,
            storage_info_len: 0,
            storage_info_pos: 0,
            storage_info_type: [0u8; 12],
        });
        w.write_all(&placeholder)?;

        let index_pos = HEADER_LEN;
        w.write_all(&index_bytes)?;

        let storage_info_pos = index_pos + index_bytes.len() as u64;
        w.write_all(&storage_info_bytes)?;
        w.flush()?;
        drop(w);

        let header = Header {
            index_len: index_bytes.len() as u64,
            index_pos,
            storage_info_len: storage_info_bytes.len() as u64,
            storage_info_pos,
            storage_info_type: self.storage_info.tag(),
        };
        let mut f = File::options().write(true).open(path)?;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&encode_header(&header))?;
        f.flush()?;

        Ok(storage_info_pos + header.storage_info_len)
    }

    /// Read a `.clip` file back into memory.
    pub fn read_from_file(path: &std::path::Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut r = BufReader::new(file);

        let mut header_buf = [0u8; HEADER_LEN as usize];
        r.read_exact(&mut header_buf)?;
        let header = decode_header(&header_buf)?;

        r.seek(SeekFrom::Start(header.index_pos))?;
        let mut index_buf = vec![0u8; header.index_len as usize];
        r.read_exact(&mut index_buf)?;
        let index: Index = bincode::deserialize(&index_buf)
            .map_err(|e| ClipError::CorruptIndex(e.to_string()))?;

        r.seek(SeekFrom::Start(header.storage_info_pos))?;
        let mut storage_info_buf = vec![0u8; header.storage_info_len as usize];
        r.read_exact(&mut storage_info_buf)?;
        let storage_info = decode_storage_info(header.storage_info_type, &storage_info_buf)?;

        Ok(Self { index, storage_info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Attr, Kind, Node, RemoteRef};

    fn sample_index() -> Index {
        let mut idx = Index::new();
        idx.set(Node {
            path: "/".into(),
            kind: Kind::Dir,
            attr: Attr {
                ino: 1,
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
        });
        idx.set(Node {
            path: "/etc/hostname".into(),
            kind: Kind::File,
            attr: Attr {
                ino: 9,
                size: 5,
                mode: 0o644,
                mtime: 10,
                atime: 10,
                ctime: 10,
                uid: 0,
                gid: 0,
                nlink: 1,
            },
            target: None,
            remote: Some(RemoteRef {
                layer_digest: "sha256:abc".into(),
                u_offset: 512,
                u_length: 5,
            }),
            content_hash: Some("sha256:xyz".into()),
        });
        idx
    }

    fn sample_storage_info() -> StorageInfo {
        let mut gzip_index_by_layer = HashMap::new();
        gzip_index_by_layer.insert("sha256:abc".to_string(), GzipIndex::new());
        let mut decompressed_hash_by_layer = HashMap::new();
        decompressed_hash_by_layer.insert("sha256:abc".to_string(), "deadbeef".to_string());
        StorageInfo::Oci(OciStorageInfo {
            registry_url: "https://registry-1.docker.io".into(),
            repository: "library/alpine".into(),
            reference: "3.18".into(),
            layers: vec!["sha256:abc".into()],
            gzip_index_by_layer,
            decompressed_hash_by_layer,
            image_metadata: None,
        })
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.clip");
        let archive = Archive::new(sample_index(), sample_storage_info());
        archive.write_to_file(&path).unwrap();

        let loaded = Archive::read_from_file(&path).unwrap();
        assert_eq!(loaded.storage_info, archive.storage_info);
        assert_eq!(loaded.index.len(), archive.index.len());
        assert_eq!(
            loaded.index.get("/etc/hostname"),
            archive.index.get("/etc/hostname")
        );
    }

    #[test]
    fn header_mismatch_on_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.clip");
        std::fs::write(&path, vec![0u8; 54]).unwrap();
        let err = Archive::read_from_file(&path).unwrap_err();
        assert!(matches!(err, ClipError::HeaderMismatch));
    }

    #[test]
    fn unsupported_storage_info_tag_is_rejected() {
        let tag = *b"s3\0\0\0\0\0\0\0\0\0\0";
        let err = decode_storage_info(tag, &[]).unwrap_err();
        assert!(matches!(err, ClipError::UnsupportedStorageInfoType(t) if t == tag));
    }
}
