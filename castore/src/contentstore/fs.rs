use std::{
    io,
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::SystemTime,
};

use async_trait::async_trait;
use data_encoding::HEXLOWER;
use pin_project_lite::pin_project;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use super::ingest::{IngestState, Ingests};
use super::{ContentReader, ContentStore, ContentWriter, Image, ImageService, Info, Status};
use crate::{oci::Descriptor, Digest, Error};

/// Stores blobs on a POSIX-compliant filesystem.
///
/// Layout below the root directory:
///  - `blobs/sha256/<hex>`: committed blobs,
///  - `ingest/<ref key>`: blobs being written, moved **atomically** into
///    `blobs/` on commit,
///  - `images.json`: the image names and their targets.
///
/// The creation time of a blob is the modification time of its file. It is
/// stamped explicitly on commit, as the mtime the kernel sets on write comes
/// from a coarser clock than [SystemTime::now].
#[derive(Clone)]
pub struct FsStore {
    root: PathBuf,
    ingests: Ingests,

    // serializes read-modify-write cycles of images.json
    images_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FsStore {
    pub async fn new(root: PathBuf) -> io::Result<Self> {
        tokio::fs::create_dir_all(root.join("blobs").join("sha256")).await?;
        tokio::fs::create_dir_all(root.join("ingest")).await?;

        Ok(Self {
            root,
            ingests: Ingests::default(),
            images_lock: Default::default(),
        })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(HEXLOWER.encode(digest.as_slice()))
    }

    fn ingest_path(&self, ref_key: &str) -> PathBuf {
        // ref keys contain a ':' between algorithm and hex, which is not
        // allowed on all filesystems.
        self.root.join("ingest").join(ref_key.replace(':', "-"))
    }

    fn images_path(&self) -> PathBuf {
        self.root.join("images.json")
    }

    async fn read_images(&self) -> Result<Vec<Image>, Error> {
        match tokio::fs::read(self.images_path()).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ContentStore for FsStore {
    #[instrument(skip_all, fields(blob.digest=%digest))]
    async fn info(&self, digest: &Digest) -> Result<Option<Info>, Error> {
        match tokio::fs::metadata(self.blob_path(digest)).await {
            Ok(metadata) => Ok(Some(Info {
                digest: *digest,
                size: metadata.len(),
                created_at: metadata.modified()?,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_statuses(&self) -> Result<Vec<Status>, Error> {
        Ok(self.ingests.list())
    }

    #[instrument(skip_all, err, fields(blob.digest=%digest))]
    async fn open_read(&self, digest: &Digest) -> Result<Option<Box<dyn ContentReader>>, Error> {
        match tokio::fs::File::open(self.blob_path(digest)).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, expected), fields(blob.digest=%expected.digest), err)]
    async fn writer(
        &self,
        ref_key: &str,
        expected: &Descriptor,
    ) -> Result<Box<dyn ContentWriter>, Error> {
        let guard = self.ingests.begin(ref_key, expected.size)?;
        let ingest_path = self.ingest_path(ref_key);
        let file = tokio::fs::File::create(&ingest_path).await?;

        Ok(Box::new(FsContentWriter {
            file,
            ingest_path,
            blob_path: self.blob_path(&expected.digest),
            state: IngestState::new(expected.clone(), guard),
        }))
    }
}

#[async_trait]
impl ImageService for FsStore {
    async fn get(&self, name: &str) -> Result<Option<Image>, Error> {
        Ok(self
            .read_images()
            .await?
            .into_iter()
            .find(|image| image.name == name))
    }

    async fn put(&self, image: Image) -> Result<(), Error> {
        let _lock = self.images_lock.lock().await;

        let mut images = self.read_images().await?;
        images.retain(|i| i.name != image.name);
        images.push(image);
        images.sort_by(|a, b| a.name.cmp(&b.name));

        // write next to the target and rename, so readers never see a
        // partially written file.
        let tmp_path = self.root.join("images.json.tmp");
        tokio::fs::write(&tmp_path, serde_json::to_vec_pretty(&images)?).await?;
        tokio::fs::rename(&tmp_path, self.images_path()).await?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<Image>, Error> {
        self.read_images().await
    }
}

pin_project! {
    pub struct FsContentWriter {
        #[pin]
        file: tokio::fs::File,
        ingest_path: PathBuf,
        blob_path: PathBuf,
        state: IngestState,
    }

    impl PinnedDrop for FsContentWriter {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            // An abandoned ingest leaves its file behind, clean it up.
            if !this.state.is_closed() {
                if let Err(e) = std::fs::remove_file(&*this.ingest_path) {
                    warn!(err=%e, path=?this.ingest_path, "unable to remove abandoned ingest");
                }
            }
        }
    }
}

impl AsyncWrite for FsContentWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.project();
        if this.state.is_closed() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "this writer is already closed",
            )));
        }

        match this.file.poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.state.observe(&buf[..n]);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().file.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().file.poll_shutdown(cx)
    }
}

#[async_trait]
impl ContentWriter for FsContentWriter {
    async fn commit(&mut self) -> Result<Info, Error> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let result = self.state.finish();
        let digest = match result {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&self.ingest_path).await;
                return Err(e);
            }
        };

        if let Ok(metadata) = tokio::fs::metadata(&self.blob_path).await {
            debug!(blob.digest=%digest, "blob already present, discarding ingest");
            tokio::fs::remove_file(&self.ingest_path).await?;
            return Ok(self.state.info(metadata.modified()?));
        }

        let created_at = SystemTime::now();
        let ingest_path = self.ingest_path.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .write(true)
                .open(&ingest_path)?
                .set_modified(created_at)
        })
        .await??;

        tokio::fs::rename(&self.ingest_path, &self.blob_path).await?;

        Ok(self.state.info(created_at))
    }
}
