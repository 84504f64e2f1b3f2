use std::collections::HashSet;

use serde_yaml::Value;

use crate::{values::Values, Chart, Error};

/// A sub-chart with its render weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// The alias if there is one, the chart name otherwise.
    pub name: String,
    pub weight: u64,
}

/// Decodes a weight. Integers and floats without a fractional part are
/// accepted, and a missing weight is 0.
pub fn decode_weight(value: Option<&Value>) -> Result<u64, String> {
    let weight: i128 = match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else if let Some(u) = n.as_u64() {
                u.into()
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() && f.fract() == 0.0 => f as i128,
                    _ => return Err("value shall be an integer".to_string()),
                }
            }
        }
        Some(_) => return Err("value shall be an integer".to_string()),
    };

    if weight < 0 {
        return Err("value shall be positive or equal to zero".to_string());
    }
    u64::try_from(weight).map_err(|_| "value is too large".to_string())
}

/// Returns one [Dependency] per sub-chart declared by `chart`, in
/// declaration order, weighted by `<name>.weight` from `values`.
pub fn dependencies(chart: &Chart, values: &Values) -> Result<Vec<Dependency>, Error> {
    let mut seen = HashSet::new();
    chart
        .metadata
        .dependencies
        .iter()
        .map(|decl| {
            let name = decl.effective_name().to_string();
            if !seen.insert(name.clone()) {
                return Err(Error::Load {
                    path: chart.name().into(),
                    reason: format!("sub-chart \"{}\" is declared more than once", name),
                });
            }

            let weight = decode_weight(values.path_value(&format!("{}.weight", name)))
                .map_err(|reason| Error::Weight {
                    name: name.clone(),
                    reason,
                })?;

            Ok(Dependency { name, weight })
        })
        .collect()
}
