//! OCI image reference parsing and the hand-rolled manifest/config JSON
//! structs the registry client and indexer operate on.
//!
//! No `oci-spec` dependency: the fields this system actually consumes are a
//! small, stable subset of the distribution-spec JSON, so plain `serde`
//! structs (in the spirit of the other example repos that avoid a heavy
//! spec crate) are enough and keep the wire shapes visible at the call site.
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::archive::ImageMetadata;

pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
pub const DEFAULT_REFERENCE: &str = "latest";

pub const MEDIA_TYPE_DOCKER_MANIFEST_V2: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// `<registry>/<repository>[:<tag>|@<digest>]`, with Docker Hub's implied
/// registry and `latest` tag filled in when the caller omits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

impl ImageReference {
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let (head, reference) = match raw.rsplit_once('@') {
            Some((h, digest)) => (h, format!("sha256{}", digest.trim_start_matches("sha256"))),
            None => match raw.rfind(':') {
                // Don't treat a port-bearing registry host's ':' as a tag
                // separator -- only a ':' after the last '/' is a tag.
                Some(idx) if raw[idx..].find('/').is_none() => {
                    (&raw[..idx], raw[idx + 1..].to_string())
                }
                _ => (raw, DEFAULT_REFERENCE.to_string()),
            },
        };

        let (registry, repository) = match head.split_once('/') {
            Some((maybe_registry, rest)) if maybe_registry.contains('.') || maybe_registry.contains(':') || maybe_registry == "localhost" => {
                (maybe_registry.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), head.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), head.to_string()),
        };

        // Docker Hub's single-segment shorthand (`alpine`) is really `library/alpine`.
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        if repository.is_empty() {
            return Err(crate::error::ClipError::CorruptIndex(format!(
                "empty repository in image reference {raw:?}"
            )));
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.reference)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

/// A single OCI/Docker v2 image manifest (after any manifest-list
/// indirection has already been resolved).
#[derive(Debug, Clone, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub config: ManifestDescriptor,
    pub layers: Vec<ManifestDescriptor>,
}

/// A manifest-list / image-index response: multiple platform-specific
/// manifests behind one tag.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    pub manifests: Vec<ManifestDescriptor>,
}

/// Either shape a `GET /v2/<name>/manifests/<ref>` response can take.
#[derive(Debug, Clone)]
pub enum ManifestResponse {
    Manifest(ImageManifest),
    List(ManifestList),
}

impl ManifestResponse {
    pub fn parse(media_type: &str, body: &[u8]) -> crate::error::Result<Self> {
        match media_type {
            MEDIA_TYPE_DOCKER_MANIFEST_LIST | MEDIA_TYPE_OCI_INDEX => {
                let list: ManifestList = serde_json::from_slice(body).map_err(|e| {
                    crate::error::ClipError::CorruptIndex(format!("manifest list: {e}"))
                })?;
                Ok(ManifestResponse::List(list))
            }
            _ => {
                let manifest: ImageManifest = serde_json::from_slice(body).map_err(|e| {
                    crate::error::ClipError::CorruptIndex(format!("manifest: {e}"))
                })?;
                Ok(ManifestResponse::Manifest(manifest))
            }
        }
    }

    /// If this is a manifest list/index, find the digest of the entry
    /// matching `(os, arch)` so the caller can refetch it by digest.
    pub fn digest_for_platform(&self, arch: &str, os: &str) -> crate::error::Result<Option<String>> {
        match self {
            ManifestResponse::Manifest(_) => Ok(None),
            ManifestResponse::List(list) => list
                .manifests
                .iter()
                .find(|m| {
                    m.platform
                        .as_ref()
                        .map(|p| p.architecture == arch && p.os == os)
                        .unwrap_or(false)
                })
                .map(|m| Some(m.digest.clone()))
                .ok_or_else(|| {
                    crate::error::ClipError::UnsupportedLayerMediaType(format!(
                        "no manifest for platform {os}/{arch} in manifest list"
                    ))
                }),
        }
    }

    pub fn into_manifest(self) -> crate::error::Result<ImageManifest> {
        match self {
            ManifestResponse::Manifest(m) => Ok(m),
            ManifestResponse::List(_) => Err(crate::error::ClipError::CorruptIndex(
                "manifest list must be resolved to a single-platform manifest first".into(),
            )),
        }
    }
}

/// The subset of the OCI image config JSON (`config.digest` blob) this
/// system retains.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ImageConfigJson {
    pub architecture: Option<String>,
    pub os: Option<String>,
    pub created: Option<String>,
    pub config: Option<ImageConfigInner>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ImageConfigInner {
    #[serde(default, rename = "Env")]
    pub env: Vec<String>,
    #[serde(default, rename = "Cmd")]
    pub cmd: Vec<String>,
    #[serde(default, rename = "Entrypoint")]
    pub entrypoint_upper: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default, rename = "Labels")]
    pub labels: HashMap<String, String>,
}

impl ImageConfigJson {
    pub fn into_image_metadata(self) -> ImageMetadata {
        let inner = self.config.unwrap_or_default();
        let entrypoint = if !inner.entrypoint.is_empty() {
            inner.entrypoint
        } else {
            inner.entrypoint_upper
        };
        ImageMetadata {
            architecture: self.architecture.unwrap_or_default(),
            os: self.os.unwrap_or_default(),
            env: inner.env,
            cmd: inner.cmd,
            entrypoint,
            labels: inner.labels,
            created: self.created,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfigJson {
    pub auths: HashMap<String, DockerConfigAuthEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfigAuthEntry {
    pub auth: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fills_in_docker_hub_defaults() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.reference, "latest");
    }

    #[test]
    fn parse_keeps_explicit_tag_and_registry() {
        let r = ImageReference::parse("ghcr.io/owner/project:v1.2.3").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "owner/project");
        assert_eq!(r.reference, "v1.2.3");
    }

    #[test]
    fn parse_handles_digest_reference() {
        let r = ImageReference::parse(
            "docker.io/library/redis@sha256:abcdef0000000000000000000000000000000000000000000000000000000a",
        )
        .unwrap();
        assert_eq!(r.repository, "library/redis");
        assert!(r.reference.starts_with("sha256"));
    }

    #[test]
    fn parse_does_not_confuse_port_with_tag() {
        let r = ImageReference::parse("localhost:5000/myimage:latest").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "myimage");
        assert_eq!(r.reference, "latest");
    }
}
