use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use data_encoding::BASE64;
use futures::TryStreamExt;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{CredentialProvider, Error, Remote, RemoteReader};
use crate::oci::{self, Descriptor, MANIFEST_ACCEPT, MEDIA_TYPE_DOCKER_SCHEMA1_MANIFEST};
use crate::reference::Reference;
use crate::Digest;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// An authentication challenge from a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic {
        realm: Option<String>,
    },
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl FromStr for Challenge {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidChallenge(s.to_string());

        let s = s.trim();
        let (scheme, params) = s.split_once(' ').unwrap_or((s, ""));
        let mut params = parse_params(params).ok_or_else(invalid)?;

        match scheme.to_ascii_lowercase().as_str() {
            "basic" => Ok(Challenge::Basic {
                realm: params.remove("realm"),
            }),
            "bearer" => Ok(Challenge::Bearer {
                realm: params.remove("realm").ok_or_else(invalid)?,
                service: params.remove("service"),
                scope: params.remove("scope"),
            }),
            _ => Err(invalid()),
        }
    }
}

/// Parses comma-separated `key=value` and `key="quoted value"` pairs. Keys are
/// lowercased.
fn parse_params(s: &str) -> Option<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut chars = s.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            return Some(params);
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) => key.push(c),
                None => return None,
            }
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => value.push(chars.next()?),
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => return None,
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
            value = value.trim().to_string();
        }

        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return None;
        }
        params.insert(key, value);
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Speaks the registry HTTP API (v2), as served by the docker registry and
/// OCI distribution implementations.
///
/// Authorization headers obtained through a challenge are cached per host and
/// repository, and sent upfront on subsequent requests.
pub struct RegistryClient {
    http_client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    scheme: &'static str,

    auth_cache: RwLock<HashMap<String, String>>,
}

impl RegistryClient {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            credentials,
            scheme: "https",
            auth_cache: Default::default(),
        }
    }

    /// Talks plain http instead of https, for local registries.
    pub fn with_plain_http(mut self) -> Self {
        self.scheme = "http";
        self
    }

    fn url(&self, reference: &Reference, kind: &str, object: &str) -> Result<Url, Error> {
        Ok(Url::parse(&format!(
            "{}://{}/v2/{}/{}/{}",
            self.scheme,
            reference.registry_host(),
            reference.path(),
            kind,
            object
        ))?)
    }

    /// Sends a request, answering an authentication challenge once if the
    /// registry asks for one.
    async fn request(
        &self,
        reference: &Reference,
        method: Method,
        url: Url,
        accept: &[&str],
    ) -> Result<Response, Error> {
        let cache_key = format!("{}/{}", reference.registry_host(), reference.path());

        let send = |authorization: Option<String>| {
            let mut req = self.http_client.request(method.clone(), url.clone());
            if !accept.is_empty() {
                req = req.header(ACCEPT, accept.join(", "));
            }
            if let Some(authorization) = authorization {
                req = req.header(AUTHORIZATION, authorization);
            }
            req.send()
        };

        let cached = self.auth_cache.read().get(&cache_key).cloned();
        let resp = send(cached).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return check_status(resp);
        }

        let challenge: Challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| Error::Unauthorized(url.to_string()))?
            .parse()?;
        debug!(?challenge, "received authentication challenge");

        let authorization = self.authorize(reference, &challenge).await?;
        self.auth_cache
            .write()
            .insert(cache_key, authorization.clone());

        let resp = send(Some(authorization)).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized(url.to_string()));
        }
        check_status(resp)
    }

    /// Produces an `Authorization` header value answering `challenge`.
    async fn authorize(
        &self,
        reference: &Reference,
        challenge: &Challenge,
    ) -> Result<String, Error> {
        let host = reference.domain();
        let credentials = self.credentials.resolve(host)?;

        match challenge {
            Challenge::Basic { .. } => {
                let credentials =
                    credentials.ok_or_else(|| Error::Unauthorized(host.to_string()))?;
                Ok(format!(
                    "Basic {}",
                    BASE64.encode(
                        format!("{}:{}", credentials.login, credentials.password).as_bytes()
                    )
                ))
            }
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let scope = scope
                    .clone()
                    .unwrap_or_else(|| format!("repository:{}:pull", reference.path()));

                let mut url = Url::parse(realm)?;
                {
                    let mut query = url.query_pairs_mut();
                    if let Some(service) = service {
                        query.append_pair("service", service);
                    }
                    query.append_pair("scope", &scope);
                }

                let mut req = self.http_client.get(url.clone());
                if let Some(credentials) = credentials {
                    req = req.basic_auth(&credentials.login, Some(&credentials.password));
                }

                let resp = req.send().await?;
                if !resp.status().is_success() {
                    warn!(status=%resp.status(), realm=%realm, "token request failed");
                    return Err(Error::Unauthorized(host.to_string()));
                }

                let token: TokenResponse = resp.json().await?;
                let token =
                    token
                        .token
                        .or(token.access_token)
                        .ok_or_else(|| Error::InvalidResponse {
                            url: url.to_string(),
                            reason: "no token in response".to_string(),
                        })?;

                Ok(format!("Bearer {}", token))
            }
        }
    }
}

fn check_status(resp: Response) -> Result<Response, Error> {
    match resp.status() {
        StatusCode::NOT_FOUND => Err(Error::NotFound(resp.url().to_string())),
        status if !status.is_success() => Err(Error::UnexpectedStatus {
            url: resp.url().to_string(),
            status,
        }),
        _ => Ok(resp),
    }
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(';').next().unwrap_or(h).trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Builds a descriptor from the headers of a manifest response, if they carry
/// everything needed.
fn descriptor_from_headers(headers: &HeaderMap) -> Option<Descriptor> {
    let media_type = content_type(headers)?;
    let digest: Digest = headers
        .get(DOCKER_CONTENT_DIGEST)?
        .to_str()
        .ok()?
        .parse()
        .ok()?;
    let size: u64 = headers.get(CONTENT_LENGTH)?.to_str().ok()?.parse().ok()?;

    Some(Descriptor::new(media_type, digest, size))
}

#[async_trait]
impl Remote for RegistryClient {
    #[instrument(skip_all, err, fields(reference=%reference))]
    async fn resolve(&self, reference: &Reference) -> Result<Descriptor, Error> {
        let url = self.url(reference, "manifests", &reference.object())?;

        let resp = self
            .request(reference, Method::HEAD, url.clone(), MANIFEST_ACCEPT)
            .await?;

        let desc = match descriptor_from_headers(resp.headers()) {
            Some(desc) => desc,
            None => {
                // not every registry sends the digest on HEAD.
                debug!("incomplete HEAD response, falling back to GET");
                let resp = self
                    .request(reference, Method::GET, url.clone(), MANIFEST_ACCEPT)
                    .await?;
                let media_type =
                    content_type(resp.headers()).ok_or_else(|| Error::InvalidResponse {
                        url: url.to_string(),
                        reason: "missing content type".to_string(),
                    })?;
                let body = resp.bytes().await?;
                Descriptor::new(media_type, Digest::of(&body), body.len() as u64)
            }
        };

        if let Some(pinned) = reference.digest() {
            if *pinned != desc.digest {
                return Err(Error::InvalidResponse {
                    url: url.to_string(),
                    reason: format!("got digest {}, expected {}", desc.digest, pinned),
                });
            }
        }

        debug!(desc.digest=%desc.digest, desc.media_type=%desc.media_type, "resolved");
        Ok(desc)
    }

    #[instrument(skip_all, err, fields(reference=%reference, desc.digest=%desc.digest))]
    async fn fetch(
        &self,
        reference: &Reference,
        desc: &Descriptor,
    ) -> Result<RemoteReader, Error> {
        let is_manifest = oci::is_manifest(&desc.media_type)
            || oci::is_index(&desc.media_type)
            || desc.media_type == MEDIA_TYPE_DOCKER_SCHEMA1_MANIFEST;

        let resp = if is_manifest {
            let url = self.url(reference, "manifests", &desc.digest.to_string())?;
            self.request(reference, Method::GET, url, &[desc.media_type.as_str()])
                .await?
        } else {
            let url = self.url(reference, "blobs", &desc.digest.to_string())?;
            self.request(reference, Method::GET, url, &[]).await?
        };

        Ok(Box::new(tokio_util::io::StreamReader::new(
            resp.bytes_stream().map_err(|e| {
                let e = e.without_url();
                warn!(e=%e, "failed to get response body");
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)
            }),
        )))
    }
}
