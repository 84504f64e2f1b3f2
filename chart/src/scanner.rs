use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::Value;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::Error;

/// Extracts container images from a rendered manifest file.
#[async_trait]
pub trait ManifestScanner: Send + Sync {
    /// Returns the images referenced in the file at `path`. Content that
    /// isn't understood is skipped, only failing to read the file is an
    /// error.
    async fn scan(&self, path: &Path) -> Result<Vec<String>, Error>;
}

#[async_trait]
impl<A> ManifestScanner for A
where
    A: AsRef<dyn ManifestScanner> + Send + Sync,
{
    async fn scan(&self, path: &Path) -> Result<Vec<String>, Error> {
        self.as_ref().scan(path).await
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
    #[serde(default)]
    init_containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    #[serde(default)]
    image: Option<String>,
}

/// Where the pod spec lives in a manifest of the given kind.
fn pod_spec_path(kind: &str) -> Option<&'static [&'static str]> {
    match kind {
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" => {
            Some(&["spec", "template", "spec"])
        }
        "CronJob" | "ScheduledJob" => Some(&["spec", "jobTemplate", "spec", "template", "spec"]),
        "Pod" => Some(&["spec"]),
        _ => None,
    }
}

/// Finds images in the pod templates of workload resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkloadScanner;

impl WorkloadScanner {
    /// Returns the images of all workloads in a (multi-document) YAML
    /// stream, in order of appearance.
    pub fn images(data: &[u8]) -> Vec<String> {
        let mut images = Vec::new();

        for document in serde_yaml::Deserializer::from_slice(data) {
            let document = match Value::deserialize(document) {
                Ok(document) => document,
                // the stream can't be resumed after a syntax error
                Err(e) => {
                    debug!(err=%e, "skipping undecodable manifest");
                    break;
                }
            };

            let Some(kind) = document.get("kind").and_then(Value::as_str) else {
                continue;
            };
            let Some(path) = pod_spec_path(kind) else {
                debug!(kind=%kind, "skipping unrecognized kind");
                continue;
            };

            let Some(pod_spec) = path.iter().try_fold(&document, |v, key| v.get(key)) else {
                continue;
            };
            let pod_spec: PodSpec = match serde_yaml::from_value(pod_spec.clone()) {
                Ok(pod_spec) => pod_spec,
                Err(e) => {
                    debug!(err=%e, kind=%kind, "skipping undecodable pod spec");
                    continue;
                }
            };

            images.extend(
                pod_spec
                    .containers
                    .into_iter()
                    .chain(pod_spec.init_containers)
                    .filter_map(|c| c.image)
                    .filter(|image| !image.trim().is_empty()),
            );
        }

        images
    }
}

#[async_trait]
impl ManifestScanner for WorkloadScanner {
    #[instrument(skip_all, fields(manifest.path=%path.display()), err)]
    async fn scan(&self, path: &Path) -> Result<Vec<String>, Error> {
        let data = tokio::fs::read(path).await.map_err(|source| Error::Scan {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self::images(&data))
    }
}

/// Lists the manifest files helm rendered for `chart_name` into `dir`.
/// A chart that rendered nothing has no directory, which gives no files.
pub async fn manifest_files(dir: &Path, chart_name: &str) -> Result<Vec<PathBuf>, Error> {
    let root = dir.join(chart_name);
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e)
                    if e.depth() == 0
                        && e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) =>
                {
                    debug!(path=%root.display(), "nothing rendered");
                    break;
                }
                Err(e) => {
                    let path = e.path().unwrap_or(root.as_path()).to_owned();
                    return Err(Error::Scan {
                        path,
                        source: e.into(),
                    });
                }
            };

            let is_manifest = entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_manifest {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    })
    .await?
}
