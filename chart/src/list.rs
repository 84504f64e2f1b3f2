use std::path::Path;

use tracing::{info, instrument};

use crate::dependencies::dependencies;
use crate::renderer::RenderRequest;
use crate::scheduler::{plan_tasks, WeightedScheduler};
use crate::values::{merged_values, ValueOptions};
use crate::{Chart, Error, ImageSet};

/// How a chart is rendered for listing its images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    pub namespace: String,
    pub values: ValueOptions,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            values: ValueOptions::default(),
        }
    }
}

/// The outcome of [list].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartImages {
    /// Name of the listed chart, from its `Chart.yaml`.
    pub chart_name: String,
    /// Sorted and deduplicated.
    pub images: Vec<String>,
}

/// Lists the images used by the chart at `chart_path` and all of its
/// sub-charts.
///
/// Sub-charts are enabled weight by weight, one render per weight. If any
/// render fails, the whole listing fails.
#[instrument(skip_all, fields(chart.path=%chart_path.display()), err)]
pub async fn list(
    chart_path: &Path,
    opts: &ListOptions,
    scheduler: &WeightedScheduler,
) -> Result<ChartImages, Error> {
    let chart = Chart::load(chart_path).await?;
    let values = merged_values(&chart, &opts.values).await?;
    let dependencies = dependencies(&chart, &values)?;

    let base = RenderRequest {
        chart_path: chart_path.to_owned(),
        namespace: opts.namespace.clone(),
        value_files: opts.values.value_files.clone(),
        values: opts.values.values.clone(),
        string_values: opts.values.string_values.clone(),
        file_values: opts.values.file_values.clone(),
    };
    let mut tasks = plan_tasks(&base, &dependencies);

    let images = ImageSet::default();
    if dependencies.is_empty() {
        if let Some(task) = tasks.pop() {
            scheduler.process(chart.name(), &task, &images).await?;
        }
    } else {
        scheduler.run(chart.name(), tasks, &images).await?;
    }

    info!(chart=%chart.name(), subcharts=dependencies.len(), images=images.len(), "listed images");
    Ok(ChartImages {
        chart_name: chart.name().to_string(),
        images: images.to_sorted_vec(),
    })
}
