use std::sync::Arc;

use url::Url;

use super::{ContentStore, FsStore, ImageService, MemoryStore};
use crate::Error;

/// Constructs a content store and the image service living next to it from
/// an URI.
///
/// The following schemes are supported:
/// - `memory://` ([MemoryStore]), doesn't take a host or path.
/// - `fs:///absolute/path` ([FsStore]), requires a path and no host.
pub async fn from_addr(
    uri: &str,
) -> Result<(Arc<dyn ContentStore>, Arc<dyn ImageService>), Error> {
    let url = Url::parse(uri)
        .map_err(|e| Error::StorageError(format!("unable to parse url: {}", e)))?;

    match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::StorageError("invalid url".to_string()));
            }
            let store = MemoryStore::default();
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        "fs" => {
            if url.has_host() {
                return Err(Error::StorageError("no host allowed".to_string()));
            }
            if url.path().is_empty() {
                return Err(Error::StorageError("fs needs a path".to_string()));
            }
            if url.path() == "/" {
                return Err(Error::StorageError(
                    "cowardly refusing to use / as store root".to_string(),
                ));
            }

            let store = FsStore::new(url.path().into()).await?;
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        scheme => Err(Error::StorageError(format!("unknown scheme: {}", scheme))),
    }
}
