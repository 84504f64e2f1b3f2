use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::Error;

/// Everything a chart is rendered with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderRequest {
    pub chart_path: PathBuf,
    pub namespace: String,
    pub value_files: Vec<PathBuf>,
    pub values: Vec<String>,
    pub string_values: Vec<String>,
    pub file_values: Vec<String>,
}

/// Renders the templates of a chart into a directory.
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn render(&self, request: &RenderRequest, output_dir: &Path) -> Result<(), Error>;
}

#[async_trait]
impl<A> ChartRenderer for A
where
    A: AsRef<dyn ChartRenderer> + Send + Sync,
{
    async fn render(&self, request: &RenderRequest, output_dir: &Path) -> Result<(), Error> {
        self.as_ref().render(request, output_dir).await
    }
}

/// Renders charts by running `helm template`.
#[derive(Debug, Clone)]
pub struct HelmRenderer {
    helm_bin: PathBuf,
}

impl HelmRenderer {
    pub fn new(helm_bin: impl Into<PathBuf>) -> Self {
        Self {
            helm_bin: helm_bin.into(),
        }
    }

    /// The arguments passed to helm. The chart files end up below
    /// `<output_dir>/<chart name>`.
    pub fn args(request: &RenderRequest, output_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "template".into(),
            request.chart_path.clone().into(),
            "--disable-openapi-validation".into(),
            "--output-dir".into(),
            output_dir.into(),
            "--namespace".into(),
            request.namespace.clone().into(),
        ];
        for v in &request.values {
            args.push("--set".into());
            args.push(v.into());
        }
        for v in &request.string_values {
            args.push("--set-string".into());
            args.push(v.into());
        }
        for v in &request.file_values {
            args.push("--set-file".into());
            args.push(v.into());
        }
        for f in &request.value_files {
            args.push("-f".into());
            args.push(f.into());
        }
        args
    }
}

#[async_trait]
impl ChartRenderer for HelmRenderer {
    #[instrument(skip_all, fields(chart.path=%request.chart_path.display()), err)]
    async fn render(&self, request: &RenderRequest, output_dir: &Path) -> Result<(), Error> {
        let args = Self::args(request, output_dir);
        debug!(bin=?self.helm_bin, args=?args, "running helm");

        let output = Command::new(&self.helm_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                bin: self.helm_bin.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            warn!(stdout=%stdout, stderr=%stderr, exit_code=%output.status, "helm template failed");
            return Err(Error::Render {
                chart: request.chart_path.display().to_string(),
                status: output.status.to_string(),
                stderr,
                stdout,
            });
        }

        debug!(stdout=%stdout, "helm template succeeded");
        Ok(())
    }
}
