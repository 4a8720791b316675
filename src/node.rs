//! Path-keyed node model and ordered index.
//!
//! Mirrors the role of [`crate::hash::Hasher`]-adjacent bookkeeping in the
//! original single-layer indexer, but keyed by absolute path instead of a
//! flat vector sorted by depth: an OCI image is built from many layers
//! applied in sequence, and a path-ordered map is what makes "last write
//! wins" and whiteout deletion cheap (a prefix scan) instead of a resort
//! after every layer.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Type of filesystem entry a [`Node`] represents.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Dir,
    File,
    Symlink,
}

/// POSIX-style attributes carried by every node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
}

/// Pointer to a file's payload inside a layer's uncompressed tar stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub layer_digest: String,
    pub u_offset: u64,
    pub u_length: u64,
}

/// One entry in the filesystem tree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub path: String,
    pub kind: Kind,
    pub attr: Attr,
    /// Symlink target text. Only meaningful for `Kind::Symlink`.
    pub target: Option<String>,
    /// Backing-store pointer. Only meaningful for `Kind::File`.
    pub remote: Option<RemoteRef>,
    /// Stable identifier for content-cache lookups, derived from
    /// `(layer_digest, path)`. Only meaningful for `Kind::File`.
    pub content_hash: Option<String>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.kind == Kind::Dir
    }
}

/// Clean an arbitrary tar entry name into an absolute, slash-separated path
/// with no `.`/`..` components and no trailing slash (except the root).
pub fn clean_path(raw: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                out.pop();
            }
            p => out.push(p),
        }
    }
    if out.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", out.join("/"))
    }
}

/// Parent directory of a cleaned absolute path. `/` is its own parent.
pub fn parent_of(path: &str) -> String {
    if path == "/" {
        return "/".to_string();
    }
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(p) => path[..p].to_string(),
        None => "/".to_string(),
    }
}

/// Path-ordered map of filesystem nodes.
///
/// Ordering is lexicographic on bytes, which is exactly what `BTreeMap`'s
/// `Ord` impl for `String` already gives us, so the "pivot at `parent +
/// \0`" trick from the design works directly against `BTreeMap::range`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Index {
    nodes: BTreeMap<String, Node>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, node: Node) {
        self.nodes.insert(node.path.clone(), node);
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn delete(&mut self, path: &str) -> Option<Node> {
        self.nodes.remove(path)
    }

    /// Delete `path` itself and every node whose path starts with
    /// `path + "/"`. Used for whiteout / opaque-whiteout application.
    pub fn delete_prefix(&mut self, path: &str) {
        self.nodes.remove(path);
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let to_remove: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| p.clone())
            .collect();
        for p in to_remove {
            self.nodes.remove(&p);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.nodes.iter()
    }

    /// Ascend the map starting at `pivot`, calling `visit` for each node in
    /// increasing path order until it returns `false`.
    pub fn ascend<'a, F>(&'a self, pivot: &str, mut visit: F)
    where
        F: FnMut(&'a Node) -> bool,
    {
        for (_, node) in self.nodes.range(pivot.to_string()..) {
            if !visit(node) {
                break;
            }
        }
    }

    /// Ensure `/a`, `/a/b`, ... exist as directories for every ancestor of
    /// `path`, synthesizing missing ones with mode `0755`.
    pub fn ensure_parents(&mut self, path: &str, fallback_time: i64, ino_seed: &str) {
        let mut ancestors: Vec<String> = Vec::new();
        let mut cur = parent_of(path);
        loop {
            if self.nodes.contains_key(&cur) {
                break;
            }
            ancestors.push(cur.clone());
            if cur == "/" {
                break;
            }
            cur = parent_of(&cur);
        }
        for p in ancestors.into_iter().rev() {
            if self.nodes.contains_key(&p) {
                continue;
            }
            let ino = crate::node::inode_for(ino_seed, &p);
            self.nodes.insert(
                p.clone(),
                Node {
                    path: p.clone(),
                    kind: Kind::Dir,
                    attr: Attr {
                        ino,
                        size: 0,
                        mode: 0o755 | libc::S_IFDIR as u32,
                        mtime: fallback_time,
                        atime: fallback_time,
                        ctime: fallback_time,
                        uid: 0,
                        gid: 0,
                        nlink: 2,
                    },
                    target: None,
                    remote: None,
                    content_hash: None,
                },
            );
        }
    }

    /// List the direct children of directory `path` using the prefix-scan
    /// algorithm from the design: ascend from `path + "\0"`, and for every
    /// node whose path starts with `path`, emit the first path segment past
    /// the prefix as a child name.
    pub fn list_dir(&self, path: &str) -> Vec<(String, &Node)> {
        let base = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let pivot = format!("{base}\0");
        let mut out = Vec::new();
        self.ascend(&pivot, |node| {
            if !node.path.starts_with(&base) {
                return false;
            }
            let suffix = &node.path[base.len()..];
            if !suffix.contains('/') && !suffix.is_empty() {
                out.push((suffix.to_string(), node));
            }
            true
        });
        out
    }
}

/// Stable 64-bit inode number derived from a layer digest (or other seed)
/// and a path. Collapses `0`/`1` to `2` since inode `1` is reserved for the
/// root and `0` is never a valid inode.
pub fn inode_for(seed: &str, path: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    path.hash(&mut hasher);
    let ino = hasher.finish();
    if ino <= 1 {
        2
    } else {
        ino
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(path: &str) -> Node {
        Node {
            path: path.to_string(),
            kind: Kind::Dir,
            attr: Attr {
                ino: inode_for("seed", path),
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

    fn file(path: &str, size: u64) -> Node {
        Node {
            path: path.to_string(),
            kind: Kind::File,
            attr: Attr {
                ino: inode_for("seed", path),
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
                layer_digest: "sha256:deadbeef".into(),
                u_offset: 0,
                u_length: size,
            }),
            content_hash: None,
        }
    }

    #[test]
    fn clean_path_normalizes() {
        assert_eq!(clean_path("a/b/../c"), "/a/c");
        assert_eq!(clean_path("./a/b/"), "/a/b");
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("../../etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn list_dir_returns_direct_children_only() {
        let mut idx = Index::new();
        idx.set(dir("/"));
        idx.set(dir("/etc"));
        idx.set(file("/etc/hostname", 4));
        idx.set(dir("/etc/ssl"));
        idx.set(file("/etc/ssl/cert.pem", 10));
        idx.set(file("/etcfoo", 1)); // must not be mistaken for a child of /etc

        let mut children: Vec<String> = idx.list_dir("/etc").into_iter().map(|(n, _)| n).collect();
        children.sort();
        assert_eq!(children, vec!["hostname".to_string(), "ssl".to_string()]);
    }

    #[test]
    fn delete_prefix_removes_subtree() {
        let mut idx = Index::new();
        idx.set(dir("/data"));
        idx.set(file("/data/a", 1));
        idx.set(file("/data/b", 1));
        idx.set(dir("/data2"));
        idx.delete_prefix("/data");
        assert!(idx.get("/data").is_none());
        assert!(idx.get("/data/a").is_none());
        assert!(idx.get("/data/b").is_none());
        assert!(idx.get("/data2").is_some());
    }

    #[test]
    fn ensure_parents_synthesizes_missing_ancestors() {
        let mut idx = Index::new();
        idx.set(dir("/"));
        idx.ensure_parents("/a/b/c", 0, "seed");
        assert!(idx.get("/a").unwrap().is_dir());
        assert!(idx.get("/a/b").unwrap().is_dir());
        assert!(idx.get("/a/b/c").is_none()); // only ancestors, not the node itself
    }

    #[test]
    fn ordering_is_byte_lexicographic_with_root_first() {
        let mut idx = Index::new();
        idx.set(dir("/"));
        idx.set(dir("/a"));
        idx.set(file("/a.txt", 1));
        let paths: Vec<&String> = idx.iter().map(|(p, _)| p).collect();
        // "/a" must sort before "/a.txt" is NOT guaranteed by plain string
        // order alone ('.' < '/' is false: '/' is 0x2F, '.' is 0x2E) -- this
        // is exactly why list_dir pivots on `parent + "\0"` rather than
        // relying on naive prefix comparison.
        assert!(paths.contains(&&"/a".to_string()));
        assert!(paths.contains(&&"/a.txt".to_string()));
    }
}
