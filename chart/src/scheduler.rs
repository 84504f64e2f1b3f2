use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info_span, instrument, warn, Instrument};

use crate::dependencies::Dependency;
use crate::renderer::{ChartRenderer, RenderRequest};
use crate::scanner::{manifest_files, ManifestScanner};
use crate::{Error, ImageSet};

/// One render of the chart, enabling the sub-charts of one weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTask {
    /// None for a chart without sub-charts.
    pub weight: Option<u64>,
    pub request: RenderRequest,
}

/// Plans one task per distinct weight, in increasing weight order. Each
/// task renders with the caller's overrides plus a single `--set` entry
/// enabling all sub-charts of its weight. Without sub-charts, the chart is
/// rendered once as it is.
pub fn plan_tasks(base: &RenderRequest, dependencies: &[Dependency]) -> Vec<RenderTask> {
    if dependencies.is_empty() {
        return vec![RenderTask {
            weight: None,
            request: base.clone(),
        }];
    }

    let mut levels: BTreeMap<u64, Vec<&str>> = BTreeMap::new();
    for dep in dependencies {
        levels.entry(dep.weight).or_default().push(&dep.name);
    }

    levels
        .into_iter()
        .map(|(weight, names)| {
            let enabled = names
                .iter()
                .map(|name| format!("{}.enabled=true", name))
                .collect::<Vec<_>>()
                .join(",");

            let mut request = base.clone();
            request.values.push(enabled);
            RenderTask {
                weight: Some(weight),
                request,
            }
        })
        .collect()
}

/// Renders tasks on a fixed pool of workers and collects the images of
/// the rendered manifests.
///
/// A worker that fails a task records the error and stops taking tasks.
/// The other workers are not interrupted, so images found by them still end
/// up in the [ImageSet], but the run as a whole fails.
#[derive(Clone)]
pub struct WeightedScheduler {
    renderer: Arc<dyn ChartRenderer>,
    scanner: Arc<dyn ManifestScanner>,
    workers: usize,
}

impl WeightedScheduler {
    pub fn new(renderer: Arc<dyn ChartRenderer>, scanner: Arc<dyn ManifestScanner>) -> Self {
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            renderer,
            scanner,
            workers,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Renders a single task and adds the images found to `images`.
    #[instrument(skip_all, fields(task.weight=?task.weight), err)]
    pub async fn process(
        &self,
        chart_name: &str,
        task: &RenderTask,
        images: &ImageSet,
    ) -> Result<(), Error> {
        process(
            self.renderer.as_ref(),
            self.scanner.as_ref(),
            chart_name,
            task,
            images,
        )
        .await
    }

    /// Runs all tasks and returns once every worker exited.
    #[instrument(skip_all, fields(chart.name=%chart_name, tasks=tasks.len(), workers=self.workers), err)]
    pub async fn run(
        &self,
        chart_name: &str,
        tasks: Vec<RenderTask>,
        images: &ImageSet,
    ) -> Result<(), Error> {
        // All tasks are queued before any worker starts, so sending never
        // waits on workers that may already have given up.
        let (tx, rx) = mpsc::channel(tasks.len().max(1));
        for task in tasks {
            if tx.send(task).await.is_err() {
                break;
            }
        }
        drop(tx);

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let errors = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let rx = rx.clone();
            let errors = errors.clone();
            let renderer = self.renderer.clone();
            let scanner = self.scanner.clone();
            let images = images.clone();
            let chart_name = chart_name.to_string();

            workers.spawn(
                async move {
                    loop {
                        let Some(task) = rx.lock().await.recv().await else {
                            break;
                        };
                        if let Err(e) =
                            process(renderer.as_ref(), scanner.as_ref(), &chart_name, &task, &images)
                                .await
                        {
                            warn!(err=%e, weight=?task.weight, "render task failed, worker stops");
                            errors.lock().push(e);
                            break;
                        }
                    }
                }
                .instrument(info_span!("worker", worker)),
            );
        }

        while let Some(res) = workers.join_next().await {
            res?;
        }

        let errors = std::mem::take(&mut *errors.lock());
        if !errors.is_empty() {
            return Err(Error::Tasks(errors));
        }
        Ok(())
    }
}

async fn process(
    renderer: &dyn ChartRenderer,
    scanner: &dyn ManifestScanner,
    chart_name: &str,
    task: &RenderTask,
    images: &ImageSet,
) -> Result<(), Error> {
    let output_dir = tempfile::Builder::new().prefix("helm-image-").tempdir()?;
    renderer.render(&task.request, output_dir.path()).await?;

    for file in manifest_files(output_dir.path(), chart_name).await? {
        for image in scanner.scan(&file).await? {
            if images.insert(&image) {
                debug!(image=%image, weight=?task.weight, "found image");
            }
        }
    }
    Ok(())
}
