//! Talking to image registries: resolving references to root descriptors,
//! fetching manifests and blobs, and the credentials used to do so.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::oci::Descriptor;
use crate::reference::Reference;

mod credentials;
mod registry;


pub use self::credentials::{
    ChainedCredentials, CredentialProvider, Credentials, DockerConfigCredentials,
    StaticCredentials,
};
pub use self::registry::{Challenge, RegistryClient};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("unauthorized to access {0}")]
    Unauthorized(String),

    #[error("unexpected status {status} for {url}")]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("invalid authentication challenge: {0}")]
    InvalidChallenge(String),

    #[error("invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("invalid credentials for {host}: {reason}")]
    InvalidCredentials { host: String, reason: String },

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A reader over content fetched from a remote.
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Something content can be pulled from.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Resolves a reference to the descriptor of its root manifest or index.
    async fn resolve(&self, reference: &Reference) -> Result<Descriptor, Error>;

    /// Fetches the content described by `desc` from the repository of
    /// `reference`. The content is not verified.
    async fn fetch(&self, reference: &Reference, desc: &Descriptor)
        -> Result<RemoteReader, Error>;
}

#[async_trait]
impl<A> Remote for A
where
    A: AsRef<dyn Remote> + Send + Sync,
{
    async fn resolve(&self, reference: &Reference) -> Result<Descriptor, Error> {
        self.as_ref().resolve(reference).await
    }

    async fn fetch(
        &self,
        reference: &Reference,
        desc: &Descriptor,
    ) -> Result<RemoteReader, Error> {
        self.as_ref().fetch(reference, desc).await
    }
}
