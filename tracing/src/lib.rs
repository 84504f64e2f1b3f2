//! Log and progress output of helm-image.
//!
//! Logs go to stderr in compact form. Spans carrying an `indicatif.pb_show`
//! field also get a progress bar, when enabled. Anything printed while bars
//! are drawn has to go through the writers of [TracingHandle].

use indicatif::ProgressStyle;
use lazy_static::lazy_static;
use tracing::Level;
use tracing_indicatif::{filter::IndicatifFilter, writer, IndicatifLayer, IndicatifWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    /// A bar counting finished items, e.g. the blobs of an image.
    pub static ref PB_PROGRESS_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix} {wide_msg} {bar:10} ({elapsed}) {pos:>7}/{len:7}"
    )
    .expect("invalid progress template");
    /// Used for spans that don't set a style of their own.
    pub static ref PB_SPINNER_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix}{spinner} {wide_msg} ({elapsed}) {pos:>7}/{len:7}"
    )
    .expect("invalid progress template");
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to install the subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::FromEnvError),
}

/// Parses the value of a boolean-ish environment variable the way helm does
/// for `HELM_DEBUG`: `1`, `true` and `on` (case-insensitive) enable it.
pub fn env_flag_enabled(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("on")
}

/// Output handles of an installed subscriber.
#[derive(Clone)]
pub struct TracingHandle {
    stdout: IndicatifWriter<writer::Stdout>,
    stderr: IndicatifWriter<writer::Stderr>,
}

impl TracingHandle {
    /// Where command output (image lists and the like) is written to.
    pub fn stdout(&self) -> IndicatifWriter<writer::Stdout> {
        self.stdout.clone()
    }

    /// Where human-readable status lines are written to.
    pub fn stderr(&self) -> IndicatifWriter<writer::Stderr> {
        self.stderr.clone()
    }
}

pub struct TracingBuilder {
    level: Level,
    progress_bar: bool,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder {
            level: Level::INFO,
            progress_bar: false,
        }
    }
}

impl TracingBuilder {
    /// The default level. `RUST_LOG`, when set, wins.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = level;
        self
    }

    /// Raises the level to at least DEBUG if `debug` is set.
    pub fn debug(mut self, debug: bool) -> TracingBuilder {
        if debug && self.level < Level::DEBUG {
            self.level = Level::DEBUG;
        }
        self
    }

    pub fn enable_progressbar(mut self) -> TracingBuilder {
        self.progress_bar = true;
        self
    }

    /// Installs the global subscriber. Fails if one is installed already.
    pub fn build(self) -> Result<TracingHandle, Error> {
        let bars = IndicatifLayer::new().with_progress_style(PB_SPINNER_STYLE.clone());
        let handle = TracingHandle {
            stdout: bars.get_stdout_writer(),
            stderr: bars.get_stderr_writer(),
        };

        let filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()?;
        let logs = tracing_subscriber::fmt::Layer::new()
            .with_writer(bars.get_stderr_writer())
            .compact();
        let bars = self
            .progress_bar
            .then(|| bars.with_filter(IndicatifFilter::new(false)));

        tracing_subscriber::registry()
            .with(filter)
            .with(logs)
            .with(bars)
            .try_init()?;

        Ok(handle)
    }
}
