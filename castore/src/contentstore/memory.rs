use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::instrument;

use super::ingest::{IngestState, Ingests};
use super::{ContentReader, ContentStore, ContentWriter, Image, ImageService, Info, Status};
use crate::{oci::Descriptor, Digest, Error};

type Blobs = Arc<RwLock<HashMap<Digest, (Bytes, SystemTime)>>>;

/// Keeps blobs and images in memory. Cloning shares the underlying data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    blobs: Blobs,
    images: Arc<RwLock<BTreeMap<String, Image>>>,
    ingests: Ingests,
}

#[async_trait]
impl ContentStore for MemoryStore {
    #[instrument(skip_all, fields(blob.digest=%digest))]
    async fn info(&self, digest: &Digest) -> Result<Option<Info>, Error> {
        let blobs = self.blobs.read();
        Ok(blobs.get(digest).map(|(data, created_at)| Info {
            digest: *digest,
            size: data.len() as u64,
            created_at: *created_at,
        }))
    }

    async fn list_statuses(&self) -> Result<Vec<Status>, Error> {
        Ok(self.ingests.list())
    }

    async fn open_read(&self, digest: &Digest) -> Result<Option<Box<dyn ContentReader>>, Error> {
        let blobs = self.blobs.read();
        Ok(blobs
            .get(digest)
            .map(|(data, _)| Box::new(Cursor::new(data.clone())) as Box<dyn ContentReader>))
    }

    #[instrument(skip(self, expected), fields(blob.digest=%expected.digest), err)]
    async fn writer(
        &self,
        ref_key: &str,
        expected: &Descriptor,
    ) -> Result<Box<dyn ContentWriter>, Error> {
        let guard = self.ingests.begin(ref_key, expected.size)?;
        Ok(Box::new(MemoryContentWriter {
            blobs: self.blobs.clone(),
            buf: Vec::with_capacity(expected.size.min(1024 * 1024) as usize),
            state: IngestState::new(expected.clone(), guard),
        }))
    }
}

#[async_trait]
impl ImageService for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<Image>, Error> {
        Ok(self.images.read().get(name).cloned())
    }

    async fn put(&self, image: Image) -> Result<(), Error> {
        self.images.write().insert(image.name.clone(), image);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Image>, Error> {
        Ok(self.images.read().values().cloned().collect())
    }
}

pub struct MemoryContentWriter {
    blobs: Blobs,
    buf: Vec<u8>,
    state: IngestState,
}

impl tokio::io::AsyncWrite for MemoryContentWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        b: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        if self.state.is_closed() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "already closed",
            )));
        }
        self.buf.extend_from_slice(b);
        self.state.observe(b);
        Poll::Ready(Ok(b.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        // shutdown is "instantaneous", we only write to memory.
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ContentWriter for MemoryContentWriter {
    async fn commit(&mut self) -> Result<Info, Error> {
        let digest = self.state.finish()?;
        let buf = std::mem::take(&mut self.buf);

        let mut blobs = self.blobs.write();
        let (_, created_at) = blobs
            .entry(digest)
            .or_insert_with(|| (Bytes::from(buf), SystemTime::now()));

        Ok(self.state.info(*created_at))
    }
}
