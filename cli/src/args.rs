use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use helm_image_castore::oci::Platform;
use helm_image_chart::{values::ValueOptions, ListOptions};
use tracing::Level;

/// Lists, pulls and saves the container images used by a helm chart and
/// its sub-charts.
///
/// Sub-charts are rendered grouped by their `<name>.weight` value, one
/// `helm template` run per weight.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t=Level::INFO, global = true)]
    pub log_level: Level,

    /// Raise the log level to DEBUG. `HELM_DEBUG` does the same.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Where pulled images are stored, `fs:///path` or `memory://`.
    /// Defaults to a directory in the user cache directory.
    #[arg(long, env = "HELM_IMAGE_STORE_ADDR", global = true)]
    pub store_addr: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Lists the images used by a chart.
    List {
        #[command(flatten)]
        chart: ChartArgs,
    },

    /// Pulls the images used by a chart into the local store.
    Pull {
        #[command(flatten)]
        chart: ChartArgs,

        #[command(flatten)]
        pull: PullArgs,
    },

    /// Pulls the images used by a chart and saves them into a tar archive.
    Save {
        #[command(flatten)]
        chart: ChartArgs,

        #[command(flatten)]
        pull: PullArgs,

        /// Archive to write, `<chart name>.tar` by default.
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },

    /// Manages the local image store.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

impl Commands {
    /// Whether the command pulls images, and progress bars are useful.
    pub fn pulls(&self) -> bool {
        matches!(self, Commands::Pull { .. } | Commands::Save { .. })
    }
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Lists the images in the store.
    List,
    /// Removes the store directory.
    Clean,
}

#[derive(Args, Debug, Clone)]
pub struct ChartArgs {
    /// Chart directory or packaged chart (`.tgz`).
    #[arg(value_name = "CHART")]
    pub chart: PathBuf,

    /// Values files, later files take precedence.
    #[arg(short = 'f', long = "values", value_name = "FILE")]
    pub value_files: Vec<PathBuf>,

    /// Set values (`key1=val1,key2=val2`).
    #[arg(long = "set", value_name = "VALUES")]
    pub values: Vec<String>,

    /// Set string values (`key1=val1,key2=val2`).
    #[arg(long = "set-string", value_name = "VALUES")]
    pub string_values: Vec<String>,

    /// Set values from files (`key1=path1,key2=path2`).
    #[arg(long = "set-file", value_name = "VALUES")]
    pub file_values: Vec<String>,

    /// Namespace the chart is rendered for.
    #[arg(short = 'n', long, env = "HELM_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// The helm binary to render charts with.
    #[arg(long, env = "HELM_BIN", default_value = "helm")]
    pub helm_bin: PathBuf,
}

impl ChartArgs {
    pub fn list_options(&self) -> ListOptions {
        ListOptions {
            namespace: self.namespace.clone(),
            values: ValueOptions {
                value_files: self.value_files.clone(),
                values: self.values.clone(),
                string_values: self.string_values.clone(),
                file_values: self.file_values.clone(),
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct PullArgs {
    /// Registry needing authentication. `host` takes the credentials from
    /// the docker config, `host=login:password` gives them explicitly.
    #[arg(short = 'a', long = "auth", value_name = "HOST")]
    pub auth: Vec<String>,

    /// Image to leave out, as printed by `list`.
    #[arg(short = 'x', long = "exclude", value_name = "IMAGE")]
    pub exclude: Vec<String>,

    /// Report the progress of every blob.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Platform to pull images for, `os[/arch[/variant]]`.
    #[arg(long, default_value = "linux/amd64")]
    pub platform: Platform,

    /// Talk to registries over plain HTTP, e.g. a local test registry.
    #[arg(long)]
    pub plain_http: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use tracing::Level;

    use super::{CacheCommands, Cli, Commands};

    #[test]
    fn list_with_values() {
        let cli = Cli::try_parse_from([
            "helm-image",
            "list",
            "./umbrella",
            "-f",
            "a.yaml",
            "--set",
            "x=1",
            "--set",
            "y=2",
            "--set-string",
            "z=3",
            "--namespace",
            "apps",
        ])
        .expect("must parse");

        let Commands::List { chart } = cli.command else {
            panic!("unexpected command");
        };
        let opts = chart.list_options();
        assert_eq!("apps", opts.namespace);
        assert_eq!(vec!["x=1", "y=2"], opts.values.values);
        assert_eq!(vec!["z=3"], opts.values.string_values);
        assert_eq!(1, opts.values.value_files.len());
        assert_eq!(Level::INFO, cli.log_level);
    }

    #[test]
    fn save_defaults() {
        let cli = Cli::try_parse_from([
            "helm-image",
            "save",
            "chart.tgz",
            "-a",
            "registry.example.com",
            "-x",
            "busybox:latest",
            "-v",
            "--log-level",
            "debug",
        ])
        .expect("must parse");

        assert_eq!(Level::DEBUG, cli.log_level);
        assert!(cli.command.pulls());
        let Commands::Save {
            chart,
            pull,
            output,
        } = cli.command
        else {
            panic!("unexpected command");
        };
        assert_eq!(None, output);
        assert_eq!("helm", chart.helm_bin.to_str().unwrap());
        assert_eq!(vec!["registry.example.com"], pull.auth);
        assert_eq!(vec!["busybox:latest"], pull.exclude);
        assert!(pull.verbose);
        assert_eq!("linux/amd64", pull.platform.to_string());
    }

    #[test]
    fn invalid_platform() {
        assert!(Cli::try_parse_from(["helm-image", "pull", "c", "--platform", ""]).is_err());
    }

    #[test]
    fn cache_commands() {
        let cli = Cli::try_parse_from(["helm-image", "cache", "clean"]).expect("must parse");
        assert!(!cli.command.pulls());
        assert!(matches!(
            cli.command,
            Commands::Cache {
                command: CacheCommands::Clean
            }
        ));
    }
}
