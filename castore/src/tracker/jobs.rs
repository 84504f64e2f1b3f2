use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::oci::{Descriptor, MEDIA_TYPE_DOCKER_SCHEMA1_MANIFEST};
use crate::Digest;

#[derive(Default)]
struct Inner {
    descs: Vec<Descriptor>,
    added: HashSet<Digest>,
    resolved: bool,
}

/// The blobs requested while pulling one image, in the order they were first
/// requested. Cloning shares the registry.
#[derive(Clone)]
pub struct Jobs {
    name: Arc<str>,
    inner: Arc<Mutex<Inner>>,
}

impl Jobs {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            inner: Default::default(),
        }
    }

    /// The name of the image being pulled.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a requested blob. Returns false if a blob with the same
    /// digest is already registered. Schema1 manifests are not tracked.
    pub fn add(&self, desc: &Descriptor) -> bool {
        if desc.media_type == MEDIA_TYPE_DOCKER_SCHEMA1_MANIFEST {
            return false;
        }

        let mut inner = self.inner.lock();
        inner.resolved = true;
        if !inner.added.insert(desc.digest) {
            return false;
        }
        inner.descs.push(desc.clone());
        true
    }

    /// Returns a copy of the registered blobs.
    pub fn jobs(&self) -> Vec<Descriptor> {
        self.inner.lock().descs.clone()
    }

    /// Whether any blob was registered yet.
    pub fn is_resolved(&self) -> bool {
        self.inner.lock().resolved
    }
}

#[cfg(test)]
mod tests {
    use super::Jobs;
    use crate::fixtures::{blob_a_descriptor, blob_b_descriptor};
    use crate::oci::{Descriptor, MEDIA_TYPE_DOCKER_SCHEMA1_MANIFEST, MEDIA_TYPE_OCI_MANIFEST};

    #[test]
    fn dedup_by_digest() {
        let jobs = Jobs::new("x:1");
        assert!(!jobs.is_resolved());

        assert!(jobs.add(&blob_a_descriptor()));
        assert!(jobs.add(&blob_b_descriptor()));

        // same digest, other media type
        let mut other = blob_a_descriptor();
        other.media_type = MEDIA_TYPE_OCI_MANIFEST.to_string();
        assert!(!jobs.add(&other));

        assert!(jobs.is_resolved());
        assert_eq!(vec![blob_a_descriptor(), blob_b_descriptor()], jobs.jobs());
    }

    #[test]
    fn skip_schema1() {
        let jobs = Jobs::new("x:1");
        let mut desc: Descriptor = blob_a_descriptor();
        desc.media_type = MEDIA_TYPE_DOCKER_SCHEMA1_MANIFEST.to_string();

        assert!(!jobs.add(&desc));
        assert!(jobs.jobs().is_empty());
        assert!(!jobs.is_resolved());
    }
}
