use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::oci::{
    Descriptor, Index, Manifest, Platform, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::reference::Reference;
use crate::remotes::{self, Remote, RemoteReader};
use crate::Digest;

lazy_static! {
    pub static ref DUMMY_DIGEST: Digest = [0u8; 32].into();

    // 2 bytes
    pub static ref BLOB_A: Bytes = vec![0x00, 0x01].into();
    pub static ref BLOB_A_DIGEST: Digest = Digest::of(&BLOB_A);

    // 1MB
    pub static ref BLOB_B: Bytes = (0..255).collect::<Vec<u8>>().repeat(4 * 1024).into();
    pub static ref BLOB_B_DIGEST: Digest = Digest::of(&BLOB_B);
}

/// A layer descriptor for BLOB_A.
pub fn blob_a_descriptor() -> Descriptor {
    Descriptor::new(MEDIA_TYPE_OCI_LAYER_GZIP, *BLOB_A_DIGEST, BLOB_A.len() as u64)
}

/// A layer descriptor for BLOB_B.
pub fn blob_b_descriptor() -> Descriptor {
    Descriptor::new(MEDIA_TYPE_OCI_LAYER_GZIP, *BLOB_B_DIGEST, BLOB_B.len() as u64)
}

fn reference_key(name: &str) -> String {
    name.parse::<Reference>()
        .expect("fixture reference must parse")
        .with_default_tag()
        .to_string()
}

/// A [Remote] serving images built in memory.
///
/// Every image built with [FakeRemote::add_image] shares [BLOB_A] as its
/// first layer. Fetches are counted per digest.
#[derive(Default)]
pub struct FakeRemote {
    tags: Mutex<HashMap<String, Descriptor>>,
    blobs: Mutex<HashMap<Digest, Bytes>>,
    platform_manifests: Mutex<HashMap<(String, String), Descriptor>>,

    fetch_counts: Mutex<HashMap<Digest, usize>>,
    fetch_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRemote {
    /// Delays every fetch by `millis`.
    pub fn with_fetch_delay(mut self, millis: u64) -> Self {
        self.fetch_delay = Some(Duration::from_millis(millis));
        self
    }

    fn add_blob(&self, media_type: &str, data: Vec<u8>) -> Descriptor {
        let desc = Descriptor::new(media_type, Digest::of(&data), data.len() as u64);
        self.blobs.lock().insert(desc.digest, data.into());
        desc
    }

    fn add_manifest(&self, name: &str, platform: &Platform, layers: Vec<Descriptor>) -> Descriptor {
        let config = self.add_blob(
            MEDIA_TYPE_OCI_CONFIG,
            serde_json::to_vec(&serde_json::json!({
                "architecture": platform.architecture,
                "os": platform.os,
                "image": name,
            }))
            .expect("fixture config must serialize"),
        );
        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config,
            layers,
        };
        self.add_blob(
            MEDIA_TYPE_OCI_MANIFEST,
            serde_json::to_vec(&manifest).expect("fixture manifest must serialize"),
        )
    }

    /// Adds an image with one manifest per platform, behind an index if
    /// `with_index` is set (otherwise only the first platform is served).
    /// Returns the root descriptor.
    pub fn add_image(&self, name: &str, platforms: &[&str], with_index: bool) -> Descriptor {
        let key = reference_key(name);

        let mut manifests = Vec::new();
        for p in platforms {
            let platform: Platform = p.parse().expect("fixture platform must parse");
            let shared = self.add_blob(MEDIA_TYPE_OCI_LAYER_GZIP, BLOB_A.to_vec());
            let layer = self.add_blob(
                MEDIA_TYPE_OCI_LAYER_GZIP,
                format!("{} {} layer", key, p).into_bytes(),
            );

            let mut desc = self.add_manifest(&key, &platform, vec![shared, layer]);
            self.platform_manifests
                .lock()
                .insert((key.clone(), p.to_string()), desc.clone());
            desc.platform = Some(platform);
            manifests.push(desc);
        }

        let root = if with_index {
            let index = Index {
                schema_version: 2,
                media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
                manifests,
                annotations: Default::default(),
            };
            self.add_blob(
                MEDIA_TYPE_OCI_INDEX,
                serde_json::to_vec(&index).expect("fixture index must serialize"),
            )
        } else {
            let mut desc = manifests.swap_remove(0);
            desc.platform = None;
            desc
        };

        self.tags.lock().insert(key, root.clone());
        root
    }

    /// Adds a single-manifest image with `n` distinct layers.
    pub fn add_image_with_layers(&self, name: &str, platform: &str, n: usize) -> Descriptor {
        let key = reference_key(name);
        let layers = (0..n)
            .map(|i| {
                self.add_blob(
                    MEDIA_TYPE_OCI_LAYER_GZIP,
                    format!("{} layer {}", key, i).into_bytes(),
                )
            })
            .collect();
        let platform = platform.parse().expect("fixture platform must parse");
        let root = self.add_manifest(&key, &platform, layers);

        self.tags.lock().insert(key, root.clone());
        root
    }

    /// Serves `data` as the root of `name`.
    pub fn add_raw(&self, name: &str, media_type: &str, data: Vec<u8>) -> Descriptor {
        let root = self.add_blob(media_type, data);
        self.tags.lock().insert(reference_key(name), root.clone());
        root
    }

    /// Returns the manifest added for a platform of an image.
    pub fn manifest_for(&self, name: &str, platform: &str) -> Descriptor {
        self.platform_manifests
            .lock()
            .get(&(reference_key(name), platform.to_string()))
            .cloned()
            .expect("no such fixture manifest")
    }

    /// Makes the remote serve wrong content for `digest`.
    pub fn corrupt(&self, digest: &Digest) {
        self.blobs
            .lock()
            .insert(*digest, Bytes::from_static(b"corrupted"));
    }

    pub fn fetch_counts(&self) -> HashMap<Digest, usize> {
        self.fetch_counts.lock().clone()
    }

    /// The highest number of fetches that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Remote for FakeRemote {
    async fn resolve(&self, reference: &Reference) -> Result<Descriptor, remotes::Error> {
        self.tags
            .lock()
            .get(&reference.to_string())
            .cloned()
            .ok_or_else(|| remotes::Error::NotFound(reference.to_string()))
    }

    async fn fetch(
        &self,
        _reference: &Reference,
        desc: &Descriptor,
    ) -> Result<RemoteReader, remotes::Error> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        *self.fetch_counts.lock().entry(desc.digest).or_default() += 1;

        let data = self
            .blobs
            .lock()
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| remotes::Error::NotFound(desc.digest.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }
}

/// A config descriptor for arbitrary data.
pub fn config_descriptor(data: &[u8]) -> Descriptor {
    Descriptor::new(MEDIA_TYPE_OCI_CONFIG, Digest::of(data), data.len() as u64)
}
