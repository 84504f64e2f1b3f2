use std::io::Write;

use helm_image_castore::tracker::{JobStatus, Jobs, Part, PartStatus, ProgressReporter};
use tracing::{debug, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

const SHORT_KEY_LEN: usize = 12;

/// The digest prefix shown for a part, like docker does for layers.
pub fn short_key(ref_key: &str) -> &str {
    match ref_key.split_once("sha256:") {
        Some((_, hex)) => hex.get(..SHORT_KEY_LEN).unwrap_or(hex),
        None => ref_key,
    }
}

pub fn status_text(status: PartStatus) -> &'static str {
    match status {
        PartStatus::Waiting => "Waiting",
        PartStatus::Downloading => "Pulling fs layer",
        PartStatus::Done => "Download complete",
        PartStatus::Exists => "Already exists",
    }
}

/// Prints every status change of a pull, one line each, and advances the
/// progress bar of `span` with every blob reaching a terminal status.
pub struct ConsoleReporter<W> {
    out: W,
    jobs: Jobs,
    span: Span,
}

impl<W> ConsoleReporter<W>
where
    W: Write + Clone + Send + Sync,
{
    pub fn new(out: W, jobs: Jobs, span: Span) -> Self {
        Self { out, jobs, span }
    }

    fn println(&self, line: std::fmt::Arguments) {
        let mut out = self.out.clone();
        if let Err(e) = writeln!(out, "{}", line) {
            debug!(err=%e, "unable to print progress");
        }
    }
}

impl<W> ProgressReporter for ConsoleReporter<W>
where
    W: Write + Clone + Send + Sync,
{
    fn job_status(&self, name: &str, status: JobStatus) {
        let status = match status {
            JobStatus::Resolving => "resolving",
            JobStatus::Resolved => "resolved",
        };
        self.println(format_args!("{}: {}", name, status));
    }

    fn status_changed(&self, ref_key: &str, part: &Part) {
        self.span.pb_set_length(self.jobs.jobs().len() as u64);
        if part.status.is_terminal() {
            self.span.pb_inc(1);
        }
        self.println(format_args!(
            "{}: {}",
            short_key(ref_key),
            status_text(part.status)
        ));
    }

    fn offset_changed(&self, ref_key: &str, part: &Part) {
        debug!(part=%short_key(ref_key), offset=part.offset, total=part.total, "transferring");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use helm_image_castore::tracker::{JobStatus, Jobs, Part, PartStatus, ProgressReporter};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tracing::Span;

    use super::{short_key, ConsoleReporter};

    #[derive(Clone, Default)]
    struct Buffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    const HEX: &str = "3f53bb00af943dfdf815650be70c0fa7b426e56a66f5e3362b47a129d57d5991";

    #[rstest]
    #[case::layer(format!("layer-sha256:{}", HEX), "3f53bb00af94")]
    #[case::manifest(format!("manifest-sha256:{}", HEX), "3f53bb00af94")]
    #[case::short(String::from("layer-sha256:abc"), "abc")]
    #[case::other(String::from("unknown-key"), "unknown-key")]
    fn short_keys(#[case] ref_key: String, #[case] exp: &str) {
        assert_eq!(exp, short_key(&ref_key));
    }

    fn part(status: PartStatus) -> Part {
        Part {
            ref_key: format!("layer-sha256:{}", HEX),
            status,
            offset: 0,
            total: 10,
            started_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn prints_transitions() {
        let out = Buffer::default();
        let reporter = ConsoleReporter::new(out.clone(), Jobs::new("nginx:1"), Span::none());
        let key = format!("layer-sha256:{}", HEX);

        reporter.job_status("nginx:1", JobStatus::Resolving);
        reporter.job_status("nginx:1", JobStatus::Resolved);
        for status in [
            PartStatus::Waiting,
            PartStatus::Downloading,
            PartStatus::Done,
        ] {
            reporter.status_changed(&key, &part(status));
        }
        reporter.offset_changed(&key, &part(PartStatus::Done));
        reporter.status_changed(&key, &part(PartStatus::Exists));

        assert_eq!(
            "nginx:1: resolving\n\
             nginx:1: resolved\n\
             3f53bb00af94: Waiting\n\
             3f53bb00af94: Pulling fs layer\n\
             3f53bb00af94: Download complete\n\
             3f53bb00af94: Already exists\n",
            out.contents()
        );
    }
}
