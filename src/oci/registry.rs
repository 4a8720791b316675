//! Synchronous OCI Distribution v2 registry client.
//!
//! Modeled on the teacher's plain `ureq`-based request style and on the
//! bearer-token challenge/response handshake from the pack's reference
//! auth implementation, collapsed into one self-contained client: a
//! request that comes back `401` with a `WWW-Authenticate: Bearer ...`
//! header is retried once with a token fetched from the realm it names.
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Backoff before the single retry of a transient (network or 5xx) failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

use base64::engine::{general_purpose::STANDARD, Engine};
use serde::Deserialize;

use crate::error::{ClipError, Result};
use crate::oci::credentials::CredentialProvider;
use crate::oci::manifest::{
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_DOCKER_MANIFEST_V2, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
};

/// What the indexer and fetcher need from a registry. Abstracted behind a
/// trait so tests can substitute an in-memory fake instead of hitting the
/// network.
pub trait RegistryClient: Send + Sync {
    /// Fetch the manifest for `reference`, returning its `Content-Type`
    /// (needed to tell a single manifest apart from a manifest list) and
    /// raw JSON body.
    fn manifest(&self, repository: &str, reference: &str) -> Result<(String, Vec<u8>)>;

    /// Fetch `[start, end]` (inclusive) bytes of a blob. `None` fetches the
    /// whole blob.
    fn blob_range(
        &self,
        repository: &str,
        digest: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Box<dyn Read + Send>>;

    /// Total size of a blob, from its `Content-Length`.
    fn blob_len(&self, repository: &str, digest: &str) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AuthChallenge {
    realm: String,
    service: String,
    scope: String,
}

impl AuthChallenge {
    fn from_header(header: &str) -> Result<Self> {
        let err = || ClipError::RegistryUnauthorized(format!("unparseable challenge: {header}"));
        let (ty, rest) = header.split_once(' ').ok_or_else(err)?;
        if !ty.eq_ignore_ascii_case("Bearer") {
            return Err(err());
        }
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for param in rest.split(',') {
            let (key, value) = param.split_once('=').ok_or_else(err)?;
            let value = value.trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }
        Ok(Self {
            realm: realm.ok_or_else(err)?,
            service: service.unwrap_or_default(),
            scope: scope.unwrap_or_default(),
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

/// `ureq`-backed [`RegistryClient`] implementation.
pub struct HttpRegistryClient {
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    agent: ureq::Agent,
    token_cache: Mutex<std::collections::HashMap<String, String>>,
}

impl HttpRegistryClient {
    pub fn new(registry: &str, credentials: Arc<dyn CredentialProvider>, timeout: Duration) -> Self {
        let base_url = if registry.starts_with("http://") || registry.starts_with("https://") {
            registry.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", registry.trim_end_matches('/'))
        };
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url,
            credentials,
            agent,
            token_cache: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn fetch_token(&self, challenge: &AuthChallenge) -> Result<String> {
        let mut req = self
            .agent
            .get(&challenge.realm)
            .query("service", &challenge.service);
        if !challenge.scope.is_empty() {
            req = req.query("scope", &challenge.scope);
        }
        if let Some(creds) = self.credentials.resolve(&self.registry_host(), &challenge.scope) {
            let basic = STANDARD.encode(format!("{}:{}", creds.username, creds.password));
            req = req.set("Authorization", &format!("Basic {basic}"));
        }
        let res = req
            .call()
            .map_err(|e| ClipError::RegistryUnauthorized(e.to_string()))?;
        let token: TokenResponse = res
            .into_json()
            .map_err(|e| ClipError::RegistryUnauthorized(e.to_string()))?;
        Ok(token.token)
    }

    fn registry_host(&self) -> String {
        self.base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string()
    }

    /// Issue `GET`/`HEAD` at `path`, transparently handling the bearer
    /// challenge/response on the first `401`. `scope` is the bearer scope
    /// to request a token for (e.g. `repository:library/alpine:pull`).
    ///
    /// A transient failure (connection/transport error or a 5xx status) on
    /// the post-auth attempt is retried once after a short backoff before
    /// being surfaced.
    fn request(
        &self,
        method: &str,
        path: &str,
        scope: &str,
        accept: Option<&str>,
        range: Option<(u64, u64)>,
    ) -> Result<ureq::Response> {
        let url = format!("{}{}", self.base_url, path);

        let build = |token: Option<&str>| {
            let mut req = self.agent.request(method, &url);
            if let Some(a) = accept {
                req = req.set("Accept", a);
            }
            if let Some((start, end)) = range {
                req = req.set("Range", &format!("bytes={start}-{end}"));
            }
            if let Some(t) = token {
                req = req.set("Authorization", &format!("Bearer {t}"));
            }
            req
        };

        let cached_token = self.token_cache.lock().unwrap().get(scope).cloned();
        let first = build(cached_token.as_deref()).call();

        let token_for_retry = match first {
            Ok(res) => return Ok(res),
            Err(ureq::Error::Status(401, res)) => {
                let header = res
                    .header("www-authenticate")
                    .ok_or_else(|| ClipError::RegistryUnauthorized(path.to_string()))?
                    .to_string();
                let challenge = AuthChallenge::from_header(&header)?;
                let token = self.fetch_token(&challenge)?;
                self.token_cache
                    .lock()
                    .unwrap()
                    .insert(scope.to_string(), token.clone());
                match build(Some(&token)).call() {
                    Ok(res) => return Ok(res),
                    Err(e) if is_transient(&e) => Some(token),
                    Err(e) => return Err(classify(path, e)),
                }
            }
            Err(e) if is_transient(&e) => cached_token,
            Err(e) => return Err(classify(path, e)),
        };

        log::warn!("transient registry error for {path}, retrying once after backoff");
        std::thread::sleep(RETRY_BACKOFF);
        build(token_for_retry.as_deref())
            .call()
            .map_err(|e| classify(path, e))
    }

    fn repo_scope(repository: &str) -> String {
        format!("repository:{repository}:pull")
    }
}

/// A connection/transport failure or a 5xx response -- worth one retry,
/// unlike a definitive 4xx rejection.
fn is_transient(e: &ureq::Error) -> bool {
    match e {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(status, _) => *status >= 500,
    }
}

fn classify(path: &str, e: ureq::Error) -> ClipError {
    match e {
        ureq::Error::Status(404, _) => ClipError::RegistryNotFound(path.to_string()),
        ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => {
            ClipError::RegistryUnauthorized(path.to_string())
        }
        ureq::Error::Status(416, _) => ClipError::RangeUnsatisfiable,
        other => ClipError::RegistryUnreachable(other.to_string()),
    }
}

impl RegistryClient for HttpRegistryClient {
    fn manifest(&self, repository: &str, reference: &str) -> Result<(String, Vec<u8>)> {
        let path = format!("/v2/{repository}/manifests/{reference}");
        let accept = [
            MEDIA_TYPE_DOCKER_MANIFEST_V2,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            MEDIA_TYPE_OCI_INDEX,
        ]
        .join(", ");
        let res = self.request("GET", &path, &Self::repo_scope(repository), Some(&accept), None)?;
        let media_type = res
            .header("content-type")
            .unwrap_or(MEDIA_TYPE_DOCKER_MANIFEST_V2)
            .to_string();
        let mut body = Vec::new();
        res.into_reader()
            .read_to_end(&mut body)
            .map_err(|e| ClipError::RegistryUnreachable(e.to_string()))?;
        Ok((media_type, body))
    }

    fn blob_range(
        &self,
        repository: &str,
        digest: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Box<dyn Read + Send>> {
        let path = format!("/v2/{repository}/blobs/{digest}");
        let res = self.request("GET", &path, &Self::repo_scope(repository), None, range)?;
        Ok(Box::new(res.into_reader()))
    }

    fn blob_len(&self, repository: &str, digest: &str) -> Result<u64> {
        let path = format!("/v2/{repository}/blobs/{digest}");
        let res = self.request("HEAD", &path, &Self::repo_scope(repository), None, None)?;
        res.header("content-length")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| ClipError::RegistryUnreachable(format!("{path}: missing Content-Length")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_parses_quoted_params_in_any_order() {
        let c = AuthChallenge::from_header(
            r#"Bearer service="registry.docker.io",realm="https://auth.docker.io/token",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(c.realm, "https://auth.docker.io/token");
        assert_eq!(c.service, "registry.docker.io");
        assert_eq!(c.scope, "repository:library/alpine:pull");
    }

    #[test]
    fn challenge_rejects_non_bearer_schemes() {
        assert!(AuthChallenge::from_header(r#"Basic realm="x""#).is_err());
    }

    #[test]
    fn repo_scope_is_pull_only() {
        assert_eq!(
            HttpRegistryClient::repo_scope("library/alpine"),
            "repository:library/alpine:pull"
        );
    }
}
