//! Pulling images from a [Remote] into a [ContentStore].

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{AcquireError, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, instrument, warn};

use crate::contentstore::{read_json, ContentStore, Image, ImageService};
use crate::oci::{self, ref_key, Descriptor, Index, Manifest, Platform};
use crate::reference::Reference;
use crate::remotes::{self, Remote};
use crate::Digest;

/// The number of layers downloaded at the same time, per image.
pub const MAX_CONCURRENT_LAYERS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Remote(#[from] remotes::Error),

    #[error("content store: {0}")]
    Store(#[from] crate::Error),

    #[error("{0}: docker schema1 manifests are not supported")]
    Schema1(String),

    #[error("{reference}: no manifest for platform {platform}")]
    NoMatchingManifest {
        reference: String,
        platform: Platform,
    },

    #[error("{reference}: unexpected media type {media_type}")]
    UnexpectedMediaType {
        reference: String,
        media_type: String,
    },

    #[error("unable to copy {0}: {1}")]
    Copy(Digest, std::io::Error),

    #[error("layer download aborted: {0}")]
    Semaphore(#[from] AcquireError),

    #[error("layer download failed: {0}")]
    Join(#[from] JoinError),
}

/// Pulls images into a content store and records them in an image service.
#[derive(Clone)]
pub struct Puller {
    store: Arc<dyn ContentStore>,
    images: Arc<dyn ImageService>,
    remote: Arc<dyn Remote>,
    max_concurrent_layers: usize,
}

impl Puller {
    pub fn new(
        store: Arc<dyn ContentStore>,
        images: Arc<dyn ImageService>,
        remote: Arc<dyn Remote>,
    ) -> Self {
        Self {
            store,
            images,
            remote,
            max_concurrent_layers: MAX_CONCURRENT_LAYERS,
        }
    }

    pub fn with_max_concurrent_layers(mut self, max_concurrent_layers: usize) -> Self {
        self.max_concurrent_layers = max_concurrent_layers.max(1);
        self
    }

    /// Pulls the image for `platform`.
    ///
    /// `handler` is called for every descriptor taking part in the pull,
    /// root first, before its content is fetched. Blobs already in the store
    /// are not fetched again. On success the image is recorded under its
    /// fully qualified name, pointing to the root descriptor.
    #[instrument(skip_all, err, fields(image=%reference, platform=%platform))]
    pub async fn pull<H>(
        &self,
        reference: &Reference,
        platform: &Platform,
        handler: H,
    ) -> Result<Image, Error>
    where
        H: Fn(&Descriptor) + Send + Sync,
    {
        let reference = reference.clone().with_default_tag();

        let root = self.remote.resolve(&reference).await?;
        self.check_media_type(&reference, &root)?;
        handler(&root);

        let manifest_desc = if oci::is_index(&root.media_type) {
            self.copy_blob(&reference, &root).await?;
            let index: Index = read_json(&*self.store, &root.digest).await?;

            let desc = index
                .manifests
                .into_iter()
                .find(|m| m.platform.as_ref().is_some_and(|p| platform.matches(p)))
                .ok_or_else(|| Error::NoMatchingManifest {
                    reference: reference.to_string(),
                    platform: platform.clone(),
                })?;
            self.check_media_type(&reference, &desc)?;
            handler(&desc);
            desc
        } else {
            root.clone()
        };

        if !oci::is_manifest(&manifest_desc.media_type) {
            return Err(Error::UnexpectedMediaType {
                reference: reference.to_string(),
                media_type: manifest_desc.media_type,
            });
        }

        self.copy_blob(&reference, &manifest_desc).await?;
        let manifest: Manifest = read_json(&*self.store, &manifest_desc.digest).await?;

        handler(&manifest.config);
        for layer in &manifest.layers {
            handler(layer);
        }

        self.copy_blob(&reference, &manifest.config).await?;

        // the same layer may appear more than once.
        let mut seen = HashSet::new();
        let layers: Vec<Descriptor> = manifest
            .layers
            .into_iter()
            .filter(|layer| seen.insert(layer.digest))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_layers));
        let mut tasks = JoinSet::new();
        for layer in layers {
            tasks.spawn({
                let this = self.clone();
                let reference = reference.clone();
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire_owned().await?;
                    this.copy_blob(&reference, &layer).await
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            result??;
        }

        let image = Image {
            name: reference.to_string(),
            target: root,
        };
        self.images.put(image.clone()).await?;
        debug!(image.name=%image.name, "pulled");

        Ok(image)
    }

    fn check_media_type(&self, reference: &Reference, desc: &Descriptor) -> Result<(), Error> {
        if desc.media_type == oci::MEDIA_TYPE_DOCKER_SCHEMA1_MANIFEST {
            warn!(image=%reference, "schema1 manifest");
            return Err(Error::Schema1(reference.to_string()));
        }
        Ok(())
    }

    /// Fetches a blob into the store, unless it's already there.
    #[instrument(skip_all, err, fields(desc.digest=%desc.digest, desc.media_type=%desc.media_type))]
    async fn copy_blob(&self, reference: &Reference, desc: &Descriptor) -> Result<(), Error> {
        if self.store.info(&desc.digest).await?.is_some() {
            debug!("already exists");
            return Ok(());
        }

        let mut writer = self.store.writer(&ref_key(desc), desc).await?;
        let mut reader = self.remote.fetch(reference, desc).await?;

        tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|e| Error::Copy(desc.digest, e))?;
        writer.commit().await?;

        Ok(())
    }
}
