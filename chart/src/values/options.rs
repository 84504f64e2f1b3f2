use std::path::PathBuf;

use serde_yaml::Value;
use tracing::instrument;

use super::strvals::{self, RawValue, ValueKind};
use super::{merge_maps, Values};
use crate::Error;

/// Value overrides given on the command line, in the flavours helm accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueOptions {
    /// `-f/--values`, applied in order.
    pub value_files: Vec<PathBuf>,
    /// `--set`
    pub values: Vec<String>,
    /// `--set-string`
    pub string_values: Vec<String>,
    /// `--set-file`
    pub file_values: Vec<String>,
}

impl ValueOptions {
    /// Merges all overrides into one set of values: value files first, then
    /// `--set`, `--set-string` and `--set-file`, each over the previous.
    #[instrument(skip_all, err)]
    pub async fn merge(&self) -> Result<Values, Error> {
        let mut base = Values::default();

        for path in &self.value_files {
            let data = tokio::fs::read(path).await.map_err(|e| {
                Error::Values(format!("unable to read {}: {}", path.display(), e))
            })?;
            let current = Values::from_slice(&data).map_err(|e| {
                Error::Values(format!("unable to parse {}: {}", path.display(), e))
            })?;
            base = merge_maps(base, current);
        }

        for s in &self.values {
            apply(&mut base, s, ValueKind::Typed).await?;
        }
        for s in &self.string_values {
            apply(&mut base, s, ValueKind::String).await?;
        }
        for s in &self.file_values {
            apply(&mut base, s, ValueKind::File).await?;
        }

        Ok(base)
    }
}

async fn apply(dest: &mut Values, input: &str, kind: ValueKind) -> Result<(), Error> {
    let assignments = strvals::parse(input).map_err(|e| match e {
        Error::Values(reason) => Error::Values(format!("failed parsing {}: {}", input, reason)),
        e => e,
    })?;

    for assignment in assignments {
        let value = match (kind, assignment.value) {
            (ValueKind::Typed, RawValue::Scalar(s)) => strvals::typed(s),
            (ValueKind::Typed, RawValue::List(items)) => {
                Value::Sequence(items.into_iter().map(strvals::typed).collect())
            }
            (ValueKind::String, RawValue::Scalar(s)) => Value::String(s),
            (ValueKind::String, RawValue::List(items)) => {
                Value::Sequence(items.into_iter().map(Value::String).collect())
            }
            (ValueKind::File, RawValue::Scalar(path)) => {
                let contents = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| Error::Values(format!("unable to read {}: {}", path, e)))?;
                Value::String(contents)
            }
            (ValueKind::File, RawValue::List(_)) => {
                return Err(Error::Values(format!(
                    "--set-file doesn't take a list: {}",
                    input
                )))
            }
        };
        strvals::set(dest.as_mapping_mut(), &assignment.path, value)?;
    }
    Ok(())
}
