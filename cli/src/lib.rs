use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use helm_image_castore::contentstore::{from_addr, ContentStore, ImageService};
use helm_image_castore::export::export;
use helm_image_castore::pull::Puller;
use helm_image_castore::reference::{normalize, Reference};
use helm_image_castore::remotes::RegistryClient;
use helm_image_castore::tracker::TransferTracker;
use helm_image_chart::renderer::HelmRenderer;
use helm_image_chart::scanner::WorkloadScanner;
use helm_image_chart::scheduler::WeightedScheduler;
use helm_image_chart::ChartImages;
use helm_image_tracing::TracingHandle;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use url::Url;

pub mod args;
mod auth;
mod progress;

use args::{CacheCommands, ChartArgs, Cli, Commands, PullArgs};
pub use progress::ConsoleReporter;

/// The store used when no `--store-addr` is given, below the user cache
/// directory.
pub fn default_store_addr() -> anyhow::Result<String> {
    let dir = dirs::cache_dir().context("unable to determine the user cache directory")?;
    Ok(format!("fs://{}", dir.join("helm-image").display()))
}

pub async fn run(cli: Cli, handle: TracingHandle) -> anyhow::Result<()> {
    let store_addr = match cli.store_addr {
        Some(addr) => addr,
        None => default_store_addr()?,
    };

    match cli.command {
        Commands::List { chart } => {
            let mut out = handle.stdout();
            for image in list_images(&chart).await?.images {
                writeln!(out, "{}", image)?;
            }
        }
        Commands::Pull { chart, pull } => {
            let images = filter_excluded(list_images(&chart).await?.images, &pull.exclude);
            let (store, image_service) = from_addr(&store_addr).await?;
            pull_images(store, image_service, &images, &pull, &handle).await?;
        }
        Commands::Save {
            chart,
            pull,
            output,
        } => {
            let listed = list_images(&chart).await?;
            let output = output_path(output, &listed.chart_name);
            let images = filter_excluded(listed.images, &pull.exclude);
            let (store, image_service) = from_addr(&store_addr).await?;
            let names =
                pull_images(store.clone(), image_service.clone(), &images, &pull, &handle).await?;
            save_images(&*store, &*image_service, &names, &pull, &output).await?;
        }
        Commands::Cache { command } => match command {
            CacheCommands::List => {
                let (_, image_service) = from_addr(&store_addr).await?;
                let mut names: Vec<String> = image_service
                    .list()
                    .await?
                    .into_iter()
                    .map(|image| image.name)
                    .collect();
                names.sort();

                let mut out = handle.stdout();
                for name in names {
                    writeln!(out, "{}", name)?;
                }
            }
            CacheCommands::Clean => clean_store(&store_addr).await?,
        },
    }
    Ok(())
}

async fn list_images(chart: &ChartArgs) -> anyhow::Result<ChartImages> {
    let scheduler = WeightedScheduler::new(
        Arc::new(HelmRenderer::new(chart.helm_bin.clone())),
        Arc::new(WorkloadScanner),
    );
    helm_image_chart::list(&chart.chart, &chart.list_options(), &scheduler)
        .await
        .with_context(|| format!("listing images of {}", chart.chart.display()))
}

/// Drops the excluded images. Both sides are compared in normalized form,
/// so `busybox` excludes `busybox:latest`.
fn filter_excluded(images: Vec<String>, exclude: &[String]) -> Vec<String> {
    let exclude: HashSet<String> = exclude.iter().map(|e| normalize(e)).collect();
    images
        .into_iter()
        .filter(|image| {
            let excluded = exclude.contains(&normalize(image));
            if excluded {
                info!(image=%image, "excluded");
            }
            !excluded
        })
        .collect()
}

/// Pulls the images one after the other, returning the names they are
/// recorded under in the store.
async fn pull_images(
    store: Arc<dyn ContentStore>,
    image_service: Arc<dyn ImageService>,
    images: &[String],
    args: &PullArgs,
    handle: &TracingHandle,
) -> anyhow::Result<Vec<String>> {
    let credentials = auth::credential_provider(&args.auth)?;
    let mut remote = RegistryClient::new(credentials);
    if args.plain_http {
        remote = remote.with_plain_http();
    }
    let puller = Puller::new(store.clone(), image_service, Arc::new(remote));

    let mut names = Vec::with_capacity(images.len());
    for image in images {
        names.push(pull_image(&puller, store.clone(), image, args, handle).await?);
    }
    Ok(names)
}

#[instrument(skip_all, fields(image=%image, indicatif.pb_show=1))]
async fn pull_image(
    puller: &Puller,
    store: Arc<dyn ContentStore>,
    image: &str,
    args: &PullArgs,
    handle: &TracingHandle,
) -> anyhow::Result<String> {
    let reference: Reference = image
        .parse()
        .with_context(|| format!("invalid image reference {}", image))?;

    let span = Span::current();
    span.pb_set_style(&helm_image_tracing::PB_PROGRESS_STYLE);
    span.pb_set_message(&format!("pulling {}", image));
    span.pb_start();

    if !args.verbose {
        let pulled = puller.pull(&reference, &args.platform, |_| {}).await?;
        info!(image=%pulled.name, "pulled");
        return Ok(pulled.name);
    }

    let tracker = TransferTracker::new(image, store);
    let reporter = ConsoleReporter::new(handle.stderr(), tracker.jobs(), span.clone());
    let tracker = tracker.with_reporter(Arc::new(reporter)).spawn();

    let jobs = tracker.jobs();
    let pulled = puller
        .pull(&reference, &args.platform, |desc| {
            jobs.add(desc);
        })
        .await;
    // the tracker runs its final pass even when the pull failed
    let parts = tracker.finish().await;

    let pulled = pulled?;
    let parts = parts.context("tracking the pull")?;
    info!(image=%pulled.name, blobs=parts.len(), "pulled");
    Ok(pulled.name)
}

/// The archive to save to, `<chart name>.tar` in the working directory
/// unless given.
fn output_path(output: Option<PathBuf>, chart_name: &str) -> PathBuf {
    output.unwrap_or_else(|| PathBuf::from(format!("{}.tar", chart_name)))
}

#[instrument(skip_all, fields(output=%output.display(), images=names.len()))]
async fn save_images(
    store: &dyn ContentStore,
    image_service: &dyn ImageService,
    names: &[String],
    args: &PullArgs,
    output: &Path,
) -> anyhow::Result<()> {
    let file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("creating {}", output.display()))?;

    let mut file = export(store, image_service, names, &args.platform, file).await?;
    file.flush().await?;
    file.sync_all().await?;

    info!("images saved");
    Ok(())
}

/// Removes the directory of a `fs://` store.
async fn clean_store(store_addr: &str) -> anyhow::Result<()> {
    let url = Url::parse(store_addr).context("invalid store address")?;
    if url.scheme() != "fs" {
        bail!("only fs:// stores can be cleaned, got {}", store_addr);
    }

    match tokio::fs::remove_dir_all(url.path()).await {
        Ok(()) => info!(path=%url.path(), "store removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path=%url.path(), "nothing to clean")
        }
        Err(e) => return Err(e).with_context(|| format!("removing {}", url.path())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use std::path::PathBuf;

    use super::{clean_store, filter_excluded, output_path};

    #[rstest]
    #[case::none(&[], &["busybox:latest", "nginx:1.27"])]
    #[case::exact(&["nginx:1.27"], &["busybox:latest"])]
    #[case::untagged(&["busybox"], &["nginx:1.27"])]
    #[case::other_tag(&["nginx:1.26"], &["busybox:latest", "nginx:1.27"])]
    #[case::unknown(&["redis"], &["busybox:latest", "nginx:1.27"])]
    fn exclude(#[case] excluded: &[&str], #[case] exp: &[&str]) {
        let images = vec!["busybox:latest".to_string(), "nginx:1.27".to_string()];
        let exclude: Vec<String> = excluded.iter().map(|s| s.to_string()).collect();
        assert_eq!(exp.to_vec(), filter_excluded(images, &exclude));
    }

    #[test]
    fn output_from_chart_name() {
        assert_eq!(PathBuf::from("umbrella.tar"), output_path(None, "umbrella"));
        assert_eq!(
            PathBuf::from("/tmp/images.tar"),
            output_path(Some("/tmp/images.tar".into()), "umbrella")
        );
    }

    #[tokio::test]
    async fn clean_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        std::fs::create_dir_all(store.join("blobs")).unwrap();
        let addr = format!("fs://{}", store.display());

        clean_store(&addr).await.expect("must clean");
        assert!(!store.exists());

        // cleaning twice is fine
        clean_store(&addr).await.expect("must clean");
    }

    #[tokio::test]
    async fn clean_memory_store() {
        assert!(clean_store("memory://").await.is_err());
    }
}
