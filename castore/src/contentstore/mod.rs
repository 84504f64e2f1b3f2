use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{oci::Descriptor, Digest, Error};

mod from_addr;
mod fs;
mod ingest;
mod memory;

#[cfg(test)]
mod tests;

pub use self::from_addr::from_addr;
pub use self::fs::FsStore;
pub use self::memory::MemoryStore;

/// Static information about a committed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub digest: Digest,
    pub size: u64,
    pub created_at: SystemTime,
}

/// Progress of a blob currently being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub ref_key: String,
    pub offset: u64,
    pub total: u64,
    pub started_at: SystemTime,
    pub updated_at: SystemTime,
}

/// A named image, pointing to its root manifest or index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub target: Descriptor,
}

/// The trait all content stores need to implement.
///
/// Blobs are addressed by their digest. Writes happen through a
/// [ContentWriter] registered under a reference key; while a writer is open,
/// its progress can be observed through [ContentStore::list_statuses]. There
/// is no notification once a write completes, callers poll.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Returns information about a committed blob, or None if the store
    /// doesn't have it. Errors are reserved for failures to answer.
    async fn info(&self, digest: &Digest) -> Result<Option<Info>, Error>;

    /// Lists the status of all writes currently in progress.
    async fn list_statuses(&self) -> Result<Vec<Status>, Error>;

    /// Opens a committed blob for reading.
    async fn open_read(&self, digest: &Digest) -> Result<Option<Box<dyn ContentReader>>, Error>;

    /// Opens a writer for the blob described by `expected`, registered under
    /// `ref_key`. Only one writer per key can be open at a time.
    async fn writer(
        &self,
        ref_key: &str,
        expected: &Descriptor,
    ) -> Result<Box<dyn ContentWriter>, Error>;
}

#[async_trait]
impl<A> ContentStore for A
where
    A: AsRef<dyn ContentStore> + Send + Sync,
{
    async fn info(&self, digest: &Digest) -> Result<Option<Info>, Error> {
        self.as_ref().info(digest).await
    }

    async fn list_statuses(&self) -> Result<Vec<Status>, Error> {
        self.as_ref().list_statuses().await
    }

    async fn open_read(&self, digest: &Digest) -> Result<Option<Box<dyn ContentReader>>, Error> {
        self.as_ref().open_read(digest).await
    }

    async fn writer(
        &self,
        ref_key: &str,
        expected: &Descriptor,
    ) -> Result<Box<dyn ContentWriter>, Error> {
        self.as_ref().writer(ref_key, expected).await
    }
}

/// A [tokio::io::AsyncWrite] that needs to be committed to persist the blob.
/// Dropping an uncommitted writer abandons the write.
#[async_trait]
pub trait ContentWriter: tokio::io::AsyncWrite + Send + Unpin {
    /// Verifies size and digest of what has been written against the
    /// expected descriptor and makes the blob available.
    ///
    /// Committing a blob the store already has succeeds and keeps the
    /// existing copy.
    async fn commit(&mut self) -> Result<Info, Error>;
}

pub trait ContentReader: tokio::io::AsyncRead + Send + Unpin + 'static {}

impl ContentReader for std::io::Cursor<bytes::Bytes> {}
impl ContentReader for tokio::fs::File {}

/// Keeps track of named images.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Image>, Error>;

    /// Inserts or replaces the image with the same name.
    async fn put(&self, image: Image) -> Result<(), Error>;

    /// Returns all images, ordered by name.
    async fn list(&self) -> Result<Vec<Image>, Error>;
}

#[async_trait]
impl<A> ImageService for A
where
    A: AsRef<dyn ImageService> + Send + Sync,
{
    async fn get(&self, name: &str) -> Result<Option<Image>, Error> {
        self.as_ref().get(name).await
    }

    async fn put(&self, image: Image) -> Result<(), Error> {
        self.as_ref().put(image).await
    }

    async fn list(&self) -> Result<Vec<Image>, Error> {
        self.as_ref().list().await
    }
}

/// Reads a whole blob into memory. Only use this for small blobs, like
/// manifests and configs.
pub async fn read_blob<CS: ContentStore + ?Sized>(
    store: &CS,
    digest: &Digest,
) -> Result<Vec<u8>, Error> {
    use tokio::io::AsyncReadExt;

    let mut reader = store
        .open_read(digest)
        .await?
        .ok_or_else(|| Error::StorageError(format!("blob {} not found", digest)))?;

    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Reads a committed blob and decodes it as JSON.
pub async fn read_json<T, CS>(store: &CS, digest: &Digest) -> Result<T, Error>
where
    T: serde::de::DeserializeOwned,
    CS: ContentStore + ?Sized,
{
    Ok(serde_json::from_slice(&read_blob(store, digest).await?)?)
}
