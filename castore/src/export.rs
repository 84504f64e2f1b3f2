//! Writing images from a content store into a tar archive.
//!
//! The archive is an OCI image layout (`oci-layout`, `index.json`,
//! `blobs/sha256/<hex>`) which also carries a docker `manifest.json`, so it
//! can be loaded by both OCI tooling and `docker load`.

use std::collections::HashSet;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::contentstore::{read_json, ContentStore, ImageService};
use crate::oci::{
    self, Descriptor, Index, Manifest, Platform, ANNOTATION_IMAGE_NAME, ANNOTATION_REF_NAME,
    MEDIA_TYPE_OCI_INDEX,
};
use crate::reference::Reference;
use crate::Digest;

const OCI_LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no images to save")]
    NoImages,

    #[error("image {0} not found")]
    ImageNotFound(String),

    #[error("{name}: no manifest for platform {platform}")]
    NoMatchingManifest { name: String, platform: Platform },

    #[error("blob {0} is missing from the content store")]
    MissingBlob(Digest),

    #[error("content store: {0}")]
    Store(#[from] crate::Error),

    #[error("unable to serialize {0}: {1}")]
    Serialize(&'static str, serde_json::Error),

    #[error("unable to write archive: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize)]
struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: &'static str,
}

/// One entry of a docker `manifest.json`.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DockerManifest {
    config: String,
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

fn blob_path(digest: &Digest) -> String {
    format!("blobs/{}/{}", digest.algorithm(), digest.encoded())
}

/// Returns the tag, or the digest for references pinned by digest only.
fn ref_name(name: &str) -> String {
    match name.parse::<Reference>() {
        Ok(reference) => reference.with_default_tag().object(),
        Err(_) => name.to_string(),
    }
}

/// Exports the images named `names` into a tar archive written to `writer`,
/// returning the writer once the archive is complete.
///
/// Of a multi-platform image only the first manifest matching `platform` is
/// included. Blobs shared between images are written once.
#[instrument(skip_all, err, fields(images=names.len(), platform=%platform))]
pub async fn export<W>(
    store: &dyn ContentStore,
    images: &dyn ImageService,
    names: &[String],
    platform: &Platform,
    writer: W,
) -> Result<W, Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    if names.is_empty() {
        return Err(Error::NoImages);
    }

    let mut builder = tokio_tar::Builder::new(writer);
    let mut written = HashSet::new();
    let mut index = Index {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
        manifests: Vec::with_capacity(names.len()),
        annotations: Default::default(),
    };
    let mut docker_manifests = Vec::with_capacity(names.len());

    for name in names {
        let image = images
            .get(name)
            .await?
            .ok_or_else(|| Error::ImageNotFound(name.clone()))?;

        let mut blobs = vec![image.target.clone()];

        let manifest_desc = if oci::is_index(&image.target.media_type) {
            let image_index: Index = read_json(store, &image.target.digest).await?;
            let desc = image_index
                .manifests
                .into_iter()
                .find(|m| m.platform.as_ref().is_some_and(|p| platform.matches(p)))
                .ok_or_else(|| Error::NoMatchingManifest {
                    name: name.clone(),
                    platform: platform.clone(),
                })?;
            blobs.push(desc.clone());
            desc
        } else {
            image.target.clone()
        };

        let manifest: Manifest = read_json(store, &manifest_desc.digest).await?;
        docker_manifests.push(DockerManifest {
            config: blob_path(&manifest.config.digest),
            repo_tags: vec![name.clone()],
            layers: manifest
                .layers
                .iter()
                .map(|l| blob_path(&l.digest))
                .collect(),
        });
        blobs.push(manifest.config);
        blobs.extend(manifest.layers);

        for desc in blobs {
            if written.insert(desc.digest) {
                append_blob(&mut builder, store, &desc).await?;
            }
        }

        let mut target = image.target;
        target
            .annotations
            .insert(ANNOTATION_IMAGE_NAME.to_string(), name.clone());
        target
            .annotations
            .insert(ANNOTATION_REF_NAME.to_string(), ref_name(name));
        index.manifests.push(target);
    }

    append_json(
        &mut builder,
        "oci-layout",
        &OciLayout {
            image_layout_version: OCI_LAYOUT_VERSION,
        },
    )
    .await?;
    append_json(&mut builder, "index.json", &index).await?;
    append_json(&mut builder, "manifest.json", &docker_manifests).await?;

    debug!(blobs = written.len(), "archive complete");

    let mut writer = builder.into_inner().await?;
    writer.flush().await?;
    Ok(writer)
}

async fn append_blob<W>(
    builder: &mut tokio_tar::Builder<W>,
    store: &dyn ContentStore,
    desc: &Descriptor,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let reader = store
        .open_read(&desc.digest)
        .await?
        .ok_or(Error::MissingBlob(desc.digest))?;

    let mut header = tokio_tar::Header::new_gnu();
    header.set_size(desc.size);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, blob_path(&desc.digest), reader)
        .await?;
    Ok(())
}

async fn append_json<W, T>(
    builder: &mut tokio_tar::Builder<W>,
    path: &'static str,
    value: &T,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
    T: Serialize,
{
    let data = serde_json::to_vec(value).map_err(|e| Error::Serialize(path, e))?;

    let mut header = tokio_tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, path, &data[..]).await?;
    Ok(())
}
