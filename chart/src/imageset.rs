use std::collections::HashSet;
use std::sync::Arc;

use helm_image_castore::reference::normalize;
use parking_lot::Mutex;

/// A set of normalized image references, shared between render workers.
/// Cloning shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ImageSet {
    /// Normalizes `image` and adds it. Returns false if it was already
    /// present.
    pub fn insert(&self, image: &str) -> bool {
        let image = normalize(image);
        self.inner.lock().insert(image)
    }

    pub fn contains(&self, image: &str) -> bool {
        self.inner.lock().contains(&normalize(image))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Returns all images, sorted.
    pub fn to_sorted_vec(&self) -> Vec<String> {
        let mut images: Vec<String> = self.inner.lock().iter().cloned().collect();
        images.sort();
        images
    }
}
