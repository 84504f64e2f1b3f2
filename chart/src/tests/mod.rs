//! Scenarios running the scheduler and `list` against a fake renderer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use crate::renderer::{ChartRenderer, RenderRequest};
use crate::scanner::WorkloadScanner;
use crate::scheduler::{plan_tasks, WeightedScheduler};
use crate::{dependencies::Dependency, list, Error, ImageSet, ListOptions};

const CHART_NAME: &str = "umbrella";

/// Writes one deployment per enabled sub-chart, plus one for the umbrella
/// chart itself, like `helm template --output-dir` does.
#[derive(Default)]
struct FakeRenderer {
    base_images: Vec<String>,
    images: HashMap<String, Vec<String>>,
    failing: Option<String>,
    requests: Mutex<Vec<RenderRequest>>,
}

impl FakeRenderer {
    fn new(base: &[&str], subcharts: &[(&str, &[&str])]) -> Self {
        Self {
            base_images: base.iter().map(|s| s.to_string()).collect(),
            images: subcharts
                .iter()
                .map(|(name, images)| {
                    (
                        name.to_string(),
                        images.iter().map(|s| s.to_string()).collect(),
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Rendering with this sub-chart enabled fails.
    fn failing(mut self, subchart: &str) -> Self {
        self.failing = Some(subchart.to_string());
        self
    }

    fn requests(&self) -> Vec<RenderRequest> {
        self.requests.lock().clone()
    }
}

fn deployment(images: &[String]) -> String {
    let containers: Vec<String> = images
        .iter()
        .map(|image| format!("        - image: '{}'\n", image))
        .collect();
    format!(
        "kind: Deployment\nspec:\n  template:\n    spec:\n      containers:\n{}",
        containers.concat()
    )
}

#[async_trait]
impl ChartRenderer for FakeRenderer {
    async fn render(&self, request: &RenderRequest, output_dir: &Path) -> Result<(), Error> {
        self.requests.lock().push(request.clone());

        let enabled: Vec<&str> = request
            .values
            .iter()
            .flat_map(|v| v.split(','))
            .filter_map(|v| v.strip_suffix(".enabled=true"))
            .collect();

        if let Some(failing) = &self.failing {
            if enabled.contains(&failing.as_str()) {
                return Err(Error::Render {
                    chart: CHART_NAME.to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: format!("{} is broken", failing),
                    stdout: String::new(),
                });
            }
        }

        let templates = output_dir.join(CHART_NAME).join("templates");
        tokio::fs::create_dir_all(&templates).await?;
        tokio::fs::write(templates.join("main.yaml"), deployment(&self.base_images)).await?;

        for name in enabled {
            if let Some(images) = self.images.get(name) {
                let dir = output_dir
                    .join(CHART_NAME)
                    .join("charts")
                    .join(name)
                    .join("templates");
                tokio::fs::create_dir_all(&dir).await?;
                tokio::fs::write(dir.join("deployment.yaml"), deployment(images)).await?;
            }
        }
        Ok(())
    }
}

fn scheduler(renderer: Arc<FakeRenderer>, workers: usize) -> WeightedScheduler {
    WeightedScheduler::new(renderer, Arc::new(WorkloadScanner)).with_workers(workers)
}

fn deps(weights: &[(&str, u64)]) -> Vec<Dependency> {
    weights
        .iter()
        .map(|(name, weight)| Dependency {
            name: name.to_string(),
            weight: *weight,
        })
        .collect()
}

#[tokio::test]
async fn collects_images_of_all_weights() {
    let renderer = Arc::new(FakeRenderer::new(
        &["umbrella:1"],
        &[("a", &["x:1", "shared:1"]), ("b", &["y"]), ("c", &["shared:1"])],
    ));

    let tasks = plan_tasks(
        &RenderRequest::default(),
        &deps(&[("a", 0), ("b", 0), ("c", 5)]),
    );
    let images = ImageSet::default();
    scheduler(renderer.clone(), 4)
        .run(CHART_NAME, tasks, &images)
        .await
        .expect("must succeed");

    assert_eq!(
        vec!["shared:1", "umbrella:1", "x:1", "y:latest"],
        images.to_sorted_vec()
    );
    assert_eq!(2, renderer.requests().len());
}

#[tokio::test]
async fn failure_fails_the_run() {
    let renderer = Arc::new(
        FakeRenderer::new(&[], &[("a", &["x:1"]), ("b", &["y:1"])]).failing("b"),
    );

    let tasks = plan_tasks(&RenderRequest::default(), &deps(&[("a", 0), ("b", 1)]));
    let images = ImageSet::default();
    let err = scheduler(renderer.clone(), 2)
        .run(CHART_NAME, tasks, &images)
        .await
        .expect_err("must fail");

    match err {
        Error::Tasks(errors) => {
            assert_eq!(1, errors.len());
            assert!(matches!(errors[0], Error::Render { .. }));
        }
        other => panic!("unexpected error: {}", other),
    }

    // the other task still completed, its images are only not returned
    assert_eq!(vec!["x:1"], images.to_sorted_vec());
}

#[tokio::test]
async fn failed_worker_stops_taking_tasks() {
    let renderer = Arc::new(
        FakeRenderer::new(&[], &[("a", &["x:1"]), ("b", &["y:1"]), ("c", &["z:1"])]).failing("a"),
    );

    let tasks = plan_tasks(
        &RenderRequest::default(),
        &deps(&[("a", 0), ("b", 1), ("c", 2)]),
    );
    let images = ImageSet::default();
    let res = scheduler(renderer.clone(), 1)
        .run(CHART_NAME, tasks, &images)
        .await;

    assert!(res.is_err());
    assert_eq!(1, renderer.requests().len());
    assert!(images.is_empty());
}

#[tokio::test]
async fn all_workers_failing_does_not_hang() {
    let renderer = Arc::new(FakeRenderer::new(&[], &[]).failing("a"));

    // more tasks than workers, all of them failing
    let weights: Vec<(String, u64)> = (0..10).map(|w| ("a".to_string(), w)).collect();
    let deps: Vec<Dependency> = weights
        .iter()
        .map(|(name, weight)| Dependency {
            name: name.clone(),
            weight: *weight,
        })
        .collect();
    let tasks = plan_tasks(&RenderRequest::default(), &deps);

    let err = scheduler(renderer.clone(), 3)
        .run(CHART_NAME, tasks, &ImageSet::default())
        .await
        .expect_err("must fail");

    assert!(matches!(&err, Error::Tasks(errors) if errors.len() == 3));
    assert_eq!(3, renderer.requests().len());
}

fn write_chart(root: &Path, chart_yaml: &str, values_yaml: &str) {
    std::fs::write(root.join("Chart.yaml"), chart_yaml).unwrap();
    std::fs::write(root.join("values.yaml"), values_yaml).unwrap();
}

const UMBRELLA: &str = r#"
apiVersion: v2
name: umbrella
version: 0.1.0
dependencies:
  - name: a
  - name: b
  - name: c
"#;

#[tokio::test]
async fn list_with_weights() {
    let dir = tempfile::tempdir().unwrap();
    write_chart(dir.path(), UMBRELLA, "c:\n  weight: 1\n");

    let renderer = Arc::new(FakeRenderer::new(
        &["umbrella:1"],
        &[("a", &["x:1"]), ("b", &["x:1"]), ("c", &["y:2"])],
    ));
    let opts = ListOptions {
        namespace: "apps".into(),
        ..Default::default()
    };

    let listed = list(dir.path(), &opts, &scheduler(renderer.clone(), 2))
        .await
        .expect("must list");
    assert_eq!("umbrella", listed.chart_name);
    assert_eq!(vec!["umbrella:1", "x:1", "y:2"], listed.images);

    let mut sets: Vec<Vec<String>> = renderer.requests().into_iter().map(|r| r.values).collect();
    sets.sort();
    assert_eq!(
        vec![
            vec!["a.enabled=true,b.enabled=true".to_string()],
            vec!["c.enabled=true".to_string()],
        ],
        sets
    );
    assert!(renderer.requests().iter().all(|r| r.namespace == "apps"));
}

#[tokio::test]
async fn list_weight_from_set() {
    let dir = tempfile::tempdir().unwrap();
    write_chart(dir.path(), UMBRELLA, "");

    let renderer = Arc::new(FakeRenderer::new(&[], &[]));
    let mut opts = ListOptions::default();
    opts.values.values = vec!["a.weight=2,b.weight=1".into()];

    list(dir.path(), &opts, &scheduler(renderer.clone(), 2))
        .await
        .expect("must list");

    // a, b and c all have different weights now
    assert_eq!(3, renderer.requests().len());
    assert!(renderer
        .requests()
        .iter()
        .all(|r| r.values[0] == "a.weight=2,b.weight=1"));
}

#[tokio::test]
async fn list_without_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    write_chart(dir.path(), "name: umbrella\n", "");

    let renderer = Arc::new(FakeRenderer::new(&["umbrella:1", "sidecar"], &[]));
    let mut opts = ListOptions::default();
    opts.values.values = vec!["x=1".into()];

    let listed = list(dir.path(), &opts, &scheduler(renderer.clone(), 2))
        .await
        .expect("must list");

    assert_eq!("umbrella", listed.chart_name);
    assert_eq!(vec!["sidecar:latest", "umbrella:1"], listed.images);
    assert_eq!(1, renderer.requests().len());
    assert_eq!(vec!["x=1".to_string()], renderer.requests()[0].values);
}

#[tokio::test]
async fn list_negative_weight() {
    let dir = tempfile::tempdir().unwrap();
    write_chart(dir.path(), UMBRELLA, "b:\n  weight: -1\n");

    let renderer = Arc::new(FakeRenderer::new(&[], &[]));
    let err = list(
        dir.path(),
        &ListOptions::default(),
        &scheduler(renderer.clone(), 2),
    )
    .await
    .expect_err("must fail");

    assert!(
        matches!(&err, Error::Weight { name, .. } if name == "b"),
        "unexpected error: {}",
        err
    );
    assert!(renderer.requests().is_empty());
}

#[tokio::test]
async fn list_render_failure() {
    let dir = tempfile::tempdir().unwrap();
    write_chart(dir.path(), UMBRELLA, "c:\n  weight: 1\n");

    let renderer = Arc::new(FakeRenderer::new(&["umbrella:1"], &[]).failing("c"));
    let res = list(
        dir.path(),
        &ListOptions::default(),
        &scheduler(renderer.clone(), 2),
    )
    .await;

    assert!(matches!(res, Err(Error::Tasks(_))));
}
