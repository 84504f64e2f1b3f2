use clap::Parser;
use helm_image_cli::args::Cli;
use helm_image_tracing::{env_flag_enabled, TracingBuilder};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let debug = cli.debug || std::env::var("HELM_DEBUG").is_ok_and(|v| env_flag_enabled(&v));
    let mut tracing = TracingBuilder::default()
        .level(cli.log_level)
        .debug(debug);
    if cli.command.pulls() {
        tracing = tracing.enable_progressbar();
    }
    let handle = tracing.build()?;

    helm_image_cli::run(cli, handle).await
}
