use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::error::Error;

/// Meaning of an unset selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unset {
    MatchAll,
    MatchNone,
}

/// Evaluate a Kubernetes label selector against a label set.
///
/// An empty selector matches everything. An unset one follows `unset`.
pub fn matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
    unset: Unset,
) -> Result<bool, Error> {
    let selector = match selector {
        Some(s) => s,
        None => return Ok(unset == Unset::MatchAll),
    };

    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels.iter() {
            if labels.get(k) != Some(v) {
                return Ok(false);
            }
        }
    }

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.as_deref().unwrap_or_default();
        let value = labels.get(&expr.key);
        let ok = match expr.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(Error::MissingSelectorValues {
                    key: expr.key.clone(),
                    operator: expr.operator.clone(),
                })
            }
            "In" => value.map(|v| values.contains(v)).unwrap_or(false),
            "NotIn" => value.map(|v| !values.contains(v)).unwrap_or(true),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => {
                return Err(Error::InvalidSelectorOperator {
                    key: expr.key.clone(),
                    operator: expr.operator.clone(),
                })
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use rstest::rstest;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, operator: &str, values: &[&str]) -> LabelSelector {
        LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: key.to_string(),
                operator: operator.to_string(),
                values: if values.is_empty() {
                    None
                } else {
                    Some(values.iter().map(|v| v.to_string()).collect())
                },
            }]),
        }
    }

    #[rstest(
        selector,
        unset,
        expected,
        case(None, Unset::MatchAll, Some(true)),
        case(None, Unset::MatchNone, Some(false)),
        case(Some(LabelSelector::default()), Unset::MatchNone, Some(true)),
        case(Some(LabelSelector { match_labels: Some(labels(&[("bgp", "a")])), match_expressions: None }), Unset::MatchNone, Some(true)),
        case(Some(LabelSelector { match_labels: Some(labels(&[("bgp", "b")])), match_expressions: None }), Unset::MatchNone, Some(false)),
        case(Some(expr("rack", "In", &["r1", "r2"])), Unset::MatchNone, Some(true)),
        case(Some(expr("rack", "NotIn", &["r1"])), Unset::MatchNone, Some(false)),
        case(Some(expr("zone", "NotIn", &["z1"])), Unset::MatchNone, Some(true)),
        case(Some(expr("bgp", "Exists", &[])), Unset::MatchNone, Some(true)),
        case(Some(expr("bgp", "DoesNotExist", &[])), Unset::MatchNone, Some(false)),
        case(Some(expr("bgp", "In", &[])), Unset::MatchNone, None),
        case(Some(expr("bgp", "Gt", &["1"])), Unset::MatchNone, None)
    )]
    fn test_matches(selector: Option<LabelSelector>, unset: Unset, expected: Option<bool>) {
        let l = labels(&[("bgp", "a"), ("rack", "r1")]);
        assert_eq!(expected, matches(selector.as_ref(), &l, unset).ok());
    }
}
