use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use async_compression::tokio::bufread::GzipDecoder;
use futures::future::BoxFuture;
use serde::{de::Error as _, Deserialize, Deserializer};
use serde_yaml::Value;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_tar::Archive;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::{values::Values, Error};

const CHART_FILE: &str = "Chart.yaml";
const REQUIREMENTS_FILE: &str = "requirements.yaml";
const VALUES_FILE: &str = "values.yaml";
const CHARTS_DIR: &str = "charts";

/// Files of a chart, relative to the chart root.
type Files = BTreeMap<PathBuf, Vec<u8>>;

/// The contents of `Chart.yaml`, as far as they matter here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub api_version: Option<String>,
    pub name: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyDecl>,
}

/// A sub-chart as declared in `Chart.yaml` (or `requirements.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DependencyDecl {
    pub name: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub version: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl DependencyDecl {
    /// The name values of this sub-chart are nested under.
    pub fn effective_name(&self) -> &str {
        match self.alias.as_deref() {
            Some(alias) if !alias.is_empty() => alias,
            _ => &self.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Requirements {
    #[serde(default)]
    dependencies: Vec<DependencyDecl>,
}

/// Versions are often written as bare numbers (`version: 1.0`).
fn scalar_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => {
            return Err(D::Error::custom(format!(
                "expected a scalar, got {:?}",
                other
            )))
        }
    })
}

/// A loaded chart with its default values and vendored sub-charts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chart {
    pub metadata: Metadata,
    pub values: Values,
    pub subcharts: Vec<Chart>,
}

impl Chart {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The key the values of `sub` live under in this chart's values.
    pub fn subchart_key<'a>(&'a self, sub: &'a Chart) -> &'a str {
        self.metadata
            .dependencies
            .iter()
            .find(|d| d.name == sub.name())
            .map(|d| d.effective_name())
            .unwrap_or(sub.name())
    }

    /// Loads a chart from a directory or a gzipped tarball.
    #[instrument(skip_all, fields(chart.path=%path.display()), err)]
    pub async fn load(path: &Path) -> Result<Chart, Error> {
        let load_err = |reason: String| Error::Load {
            path: path.to_owned(),
            reason,
        };

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| load_err(e.to_string()))?;

        let files = if metadata.is_dir() {
            read_dir(path.to_owned()).await?
        } else {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| load_err(e.to_string()))?;
            read_archive(file)
                .await
                .map_err(|e| load_err(format!("invalid chart archive: {}", e)))?
        };

        from_files(path.to_owned(), files).await
    }
}

/// Whether a file is needed to build a [Chart]: the chart files of the
/// chart itself and of everything under `charts/`, recursively.
fn wanted(path: &Path) -> bool {
    let components: Vec<Component> = path.components().collect();
    let mut rest = &components[..];
    loop {
        match rest {
            [Component::Normal(name)] => {
                return [CHART_FILE, REQUIREMENTS_FILE, VALUES_FILE]
                    .iter()
                    .any(|f| name.to_str() == Some(*f))
            }
            [Component::Normal(dir), Component::Normal(archive)]
                if dir.to_str() == Some(CHARTS_DIR) =>
            {
                return is_archive(archive)
            }
            [Component::Normal(dir), Component::Normal(_), tail @ ..]
                if dir.to_str() == Some(CHARTS_DIR) =>
            {
                rest = tail
            }
            _ => return false,
        }
    }
}

fn is_archive(name: &OsStr) -> bool {
    name.to_str().is_some_and(|n| n.ends_with(".tgz"))
}

async fn read_dir(root: PathBuf) -> Result<Files, Error> {
    tokio::task::spawn_blocking(move || {
        let load_err = |reason: String| Error::Load {
            path: root.clone(),
            reason,
        };

        let mut files = Files::new();
        for entry in WalkDir::new(&root).follow_links(true) {
            let entry = entry.map_err(|e| load_err(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&root)
                .map_err(|e| load_err(e.to_string()))?;
            if !wanted(relative) {
                continue;
            }
            let data = std::fs::read(entry.path()).map_err(|e| load_err(e.to_string()))?;
            files.insert(relative.to_owned(), data);
        }
        Ok(files)
    })
    .await?
}

/// Reads a chart archive. All entries live below a single top-level
/// directory, named after the chart, which is stripped.
async fn read_archive<R: AsyncRead + Unpin>(reader: R) -> std::io::Result<Files> {
    let mut archive = Archive::new(GzipDecoder::new(BufReader::new(reader)));
    let mut entries = archive.entries()?;

    let mut files = Files::new();
    while let Some(mut entry) = entries.try_next().await? {
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let relative: PathBuf = entry.path()?.components().skip(1).collect();
        if relative.as_os_str().is_empty() || !wanted(&relative) {
            continue;
        }

        let mut data = Vec::new();
        entry.read_to_end(&mut data).await?;
        files.insert(relative, data);
    }
    Ok(files)
}

fn from_files(source: PathBuf, mut files: Files) -> BoxFuture<'static, Result<Chart, Error>> {
    Box::pin(async move {
        let load_err = |reason: String| Error::Load {
            path: source.clone(),
            reason,
        };

        let chart_file = files
            .remove(Path::new(CHART_FILE))
            .ok_or_else(|| load_err(format!("{} file is missing", CHART_FILE)))?;
        let mut metadata: Metadata = serde_yaml::from_slice(&chart_file)
            .map_err(|e| load_err(format!("invalid {}: {}", CHART_FILE, e)))?;
        if metadata.name.is_empty() {
            return Err(load_err("chart name is missing".to_string()));
        }

        // apiVersion v1 charts declare their dependencies separately
        if let Some(data) = files.remove(Path::new(REQUIREMENTS_FILE)) {
            if metadata.api_version.as_deref() != Some("v2") {
                let requirements: Requirements = serde_yaml::from_slice(&data)
                    .map_err(|e| load_err(format!("invalid {}: {}", REQUIREMENTS_FILE, e)))?;
                metadata.dependencies.extend(requirements.dependencies);
            }
        }

        let values = match files.remove(Path::new(VALUES_FILE)) {
            Some(data) => Values::from_slice(&data)
                .map_err(|e| load_err(format!("invalid {}: {}", VALUES_FILE, e)))?,
            None => Values::default(),
        };

        let mut dirs: BTreeMap<PathBuf, Files> = BTreeMap::new();
        let mut archives = Vec::new();
        for (path, data) in files {
            let mut components = path.components().skip(1);
            let Some(Component::Normal(first)) = components.next() else {
                continue;
            };
            let inner: PathBuf = components.collect();
            if inner.as_os_str().is_empty() {
                archives.push((source.join(CHARTS_DIR).join(first), data));
            } else {
                dirs.entry(source.join(CHARTS_DIR).join(first))
                    .or_default()
                    .insert(inner, data);
            }
        }

        let mut subcharts = Vec::new();
        for (path, files) in dirs {
            subcharts.push(from_files(path, files).await?);
        }
        for (path, data) in archives {
            let files = read_archive(Cursor::new(data)).await.map_err(|e| Error::Load {
                path: path.clone(),
                reason: format!("invalid chart archive: {}", e),
            })?;
            subcharts.push(from_files(path, files).await?);
        }

        debug!(chart=%metadata.name, subcharts=subcharts.len(), "loaded chart");

        Ok(Chart {
            metadata,
            values,
            subcharts,
        })
    })
}
