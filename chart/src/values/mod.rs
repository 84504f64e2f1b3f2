//! Chart values: loading, coalescing sub-chart defaults and merging
//! overrides.

use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::{Chart, Error};

mod options;
pub(crate) mod strvals;

pub use options::ValueOptions;
pub use strvals::ValueKind;

/// A tree of values, the root always being a map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values(Mapping);

impl Values {
    /// Parses a YAML document. An empty document gives empty values.
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_yaml::Error> {
        // blank or comment-only files are common for values.yaml
        if is_blank(data) {
            return Ok(Values::default());
        }
        let mapping: Option<Mapping> = serde_yaml::from_slice(data)?;
        Ok(Values(mapping.unwrap_or_default()))
    }

    pub fn as_mapping(&self) -> &Mapping {
        &self.0
    }

    pub fn as_mapping_mut(&mut self) -> &mut Mapping {
        &mut self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Looks up a dotted path like `redis.weight`. Every component but the
    /// last has to be a map.
    pub fn path_value(&self, path: &str) -> Option<&Value> {
        let mut components = path.split('.');
        let first = components.next()?;
        let mut current = self.0.get(first)?;
        for component in components {
            current = current.as_mapping()?.get(component)?;
        }
        Some(current)
    }
}

fn is_blank(data: &[u8]) -> bool {
    String::from_utf8_lossy(data).lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#') || line == "---"
    })
}

impl From<Mapping> for Values {
    fn from(value: Mapping) -> Self {
        Values(value)
    }
}

/// Deep merges `b` into `a`, values of `b` winning. Only maps are merged,
/// lists are replaced as a whole.
pub fn merge_maps(a: Values, b: Values) -> Values {
    Values(merge_mappings(a.0, b.0))
}

fn merge_mappings(mut a: Mapping, b: Mapping) -> Mapping {
    for (key, value) in b {
        let merged = match (a.remove(&key), value) {
            (Some(Value::Mapping(a_inner)), Value::Mapping(b_inner)) => {
                Value::Mapping(merge_mappings(a_inner, b_inner))
            }
            (_, value) => value,
        };
        a.insert(key, merged);
    }
    a
}

/// Returns the values of `chart` with the defaults of all its sub-charts
/// nested under their names (or aliases). Values the parent sets for a
/// sub-chart win over the sub-chart's own defaults; a `null` removes the
/// default.
pub fn coalesce(chart: &Chart) -> Values {
    let mut values = chart.values.clone();

    for sub in &chart.subcharts {
        let key = Value::String(chart.subchart_key(sub).to_string());
        let defaults = coalesce(sub).0;

        match values.0.get_mut(&key) {
            Some(Value::Mapping(parent)) => coalesce_tables(parent, &defaults),
            None | Some(Value::Null) => {
                values.0.insert(key, Value::Mapping(defaults));
            }
            Some(_) => {
                warn!(chart=%chart.name(), subchart=%sub.name(), "skipped sub-chart values, parent value is not a map");
            }
        }
    }

    values
}

fn coalesce_tables(dst: &mut Mapping, src: &Mapping) {
    for (key, value) in src {
        match dst.get_mut(key) {
            None => {
                dst.insert(key.clone(), value.clone());
            }
            Some(Value::Null) => {
                dst.remove(key);
            }
            Some(Value::Mapping(inner)) => {
                if let Value::Mapping(src_inner) = value {
                    coalesce_tables(inner, src_inner);
                }
            }
            Some(_) => {}
        }
    }
}

/// The values a render of `chart` starts from: the coalesced chart values
/// with the user supplied overrides merged on top.
pub async fn merged_values(chart: &Chart, opts: &ValueOptions) -> Result<Values, Error> {
    Ok(merge_maps(coalesce(chart), opts.merge().await?))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_yaml::Value;

    use super::{merge_maps, Values};

    fn values(s: &str) -> Values {
        Values::from_slice(s.as_bytes()).expect("valid values")
    }

    #[rstest]
    #[case::disjoint("a: 1", "b: 2", "{a: 1, b: 2}")]
    #[case::override_scalar("a: 1", "a: 2", "a: 2")]
    #[case::deep("a: {x: 1, y: 1}", "a: {y: 2}", "a: {x: 1, y: 2}")]
    #[case::map_over_scalar("a: 1", "a: {x: 1}", "a: {x: 1}")]
    #[case::scalar_over_map("a: {x: 1}", "a: 1", "a: 1")]
    #[case::list_replaced("a: [1, 2]", "a: [3]", "a: [3]")]
    fn merge(#[case] a: &str, #[case] b: &str, #[case] exp: &str) {
        assert_eq!(values(exp), merge_maps(values(a), values(b)));
    }

    #[rstest]
    #[case::top_level("a", Some("1"))]
    #[case::nested("redis.weight", Some("2"))]
    #[case::missing_leaf("redis.other", None)]
    #[case::missing_parent("nope.weight", None)]
    #[case::through_scalar("a.b", None)]
    #[case::table("redis", Some("{weight: 2}"))]
    fn path_value(#[case] path: &str, #[case] exp: Option<&str>) {
        let v = values("a: 1\nredis:\n  weight: 2\n");
        let exp: Option<Value> = exp.map(|s| serde_yaml::from_str(s).unwrap());
        assert_eq!(exp.as_ref(), v.path_value(path));
    }

    #[test]
    fn empty_document() {
        assert_eq!(Values::default(), values(""));
        assert_eq!(Values::default(), values("# only a comment\n"));
    }

    #[test]
    fn non_map_document() {
        assert!(Values::from_slice(b"- a\n- b\n").is_err());
    }
}
