//! Label-selector evaluation against workload label maps.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use snafu::Snafu;

type Result<T, E = SelectorError> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Snafu)]
pub enum SelectorError {
    #[snafu(display("label selector with binary operator {operator:?} must have values"))]
    BinaryOperatorWithoutValues { operator: String },

    #[snafu(display("label selector with unary operator {operator:?} must not have values"))]
    UnaryOperatorWithValues { operator: String },

    #[snafu(display("label selector has an invalid operator {operator:?}"))]
    InvalidOperator { operator: String },
}

/// This trait extends the functionality of [`LabelSelector`].
pub trait LabelSelectorExt {
    /// Evaluates the selector against a workload's label map.
    ///
    /// Implements the Kubernetes semantics for `matchLabels` plus the
    /// `In`, `NotIn`, `Exists` and `DoesNotExist` expression operators. An
    /// empty selector matches everything.
    fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool>;

    /// Converts the selector to a string usable in Kubernetes API list calls.
    fn to_query_string(&self) -> Result<String>;

    /// A crude specificity measure used for flow-drop attribution: the number
    /// of terms the selector pins down. More terms means a more specific
    /// policy.
    fn specificity(&self) -> usize;
}

impl LabelSelectorExt for LabelSelector {
    fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool> {
        if let Some(match_labels) = &self.match_labels {
            for (key, value) in match_labels {
                if labels.get(key) != Some(value) {
                    return Ok(false);
                }
            }
        }

        if let Some(expressions) = &self.match_expressions {
            for requirement in expressions {
                let found = labels.get(&requirement.key);
                let matched = match requirement.operator.as_str() {
                    operator @ ("In" | "NotIn") => match &requirement.values {
                        Some(values) if !values.is_empty() => {
                            let contained = found.is_some_and(|v| values.contains(v));
                            // NotIn also selects objects that lack the key.
                            if operator == "In" { contained } else { !contained }
                        }
                        _ => {
                            return BinaryOperatorWithoutValuesSnafu {
                                operator: operator.to_owned(),
                            }
                            .fail();
                        }
                    },
                    operator @ ("Exists" | "DoesNotExist") => {
                        if requirement.values.as_ref().is_some_and(|v| !v.is_empty()) {
                            return UnaryOperatorWithValuesSnafu {
                                operator: operator.to_owned(),
                            }
                            .fail();
                        }
                        if operator == "Exists" { found.is_some() } else { found.is_none() }
                    }
                    operator => {
                        return InvalidOperatorSnafu {
                            operator: operator.to_owned(),
                        }
                        .fail();
                    }
                };

                if !matched {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    fn to_query_string(&self) -> Result<String> {
        let mut query_string = String::new();

        // match_labels are equivalent to "In" expressions with a single
        // value, joined on commas.
        if let Some(label_map) = &self.match_labels {
            query_string.push_str(
                &label_map
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }

        if let Some(requirements) = &self.match_expressions {
            if !requirements.is_empty() && !query_string.is_empty() {
                query_string.push(',');
            }

            let expression_string: Result<Vec<String>> = requirements
                .iter()
                .map(|requirement| match requirement.operator.as_str() {
                    operator @ ("In" | "NotIn") => match &requirement.values {
                        Some(values) if !values.is_empty() => Ok(format!(
                            "{} {} ({})",
                            requirement.key,
                            operator.to_ascii_lowercase(),
                            values.join(", ")
                        )),
                        _ => BinaryOperatorWithoutValuesSnafu {
                            operator: operator.to_owned(),
                        }
                        .fail(),
                    },
                    operator @ "Exists" => match &requirement.values {
                        Some(values) if !values.is_empty() => UnaryOperatorWithValuesSnafu {
                            operator: operator.to_owned(),
                        }
                        .fail(),
                        _ => Ok(requirement.key.to_string()),
                    },
                    operator @ "DoesNotExist" => match &requirement.values {
                        Some(values) if !values.is_empty() => UnaryOperatorWithValuesSnafu {
                            operator: operator.to_owned(),
                        }
                        .fail(),
                        _ => Ok(format!("!{key}", key = requirement.key)),
                    },
                    operator => InvalidOperatorSnafu {
                        operator: operator.to_owned(),
                    }
                    .fail(),
                })
                .collect();

            query_string.push_str(&expression_string?.join(","));
        }

        Ok(query_string)
    }

    fn specificity(&self) -> usize {
        self.match_labels.as_ref().map_or(0, BTreeMap::len)
            + self.match_expressions.as_ref().map_or(0, Vec::len)
    }
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

    fn requirement(key: &str, operator: &str, values: Option<Vec<&str>>) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: values.map(|v| v.into_iter().map(str::to_string).collect()),
        }
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector.matches(&labels(&[("app", "web")])).unwrap());
        assert!(selector.matches(&BTreeMap::new()).unwrap());
    }

    #[test]
    fn match_labels_require_all_pairs() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web"), ("tier", "frontend")])),
            ..LabelSelector::default()
        };
        assert!(
            selector
                .matches(&labels(&[("app", "web"), ("tier", "frontend"), ("x", "y")]))
                .unwrap()
        );
        assert!(!selector.matches(&labels(&[("app", "web")])).unwrap());
        assert!(
            !selector
                .matches(&labels(&[("app", "db"), ("tier", "frontend")]))
                .unwrap()
        );
    }

    #[rstest]
    #[case::in_hit("In", Some(vec!["web", "api"]), &[("app", "web")], true)]
    #[case::in_miss("In", Some(vec!["web", "api"]), &[("app", "db")], false)]
    #[case::in_absent("In", Some(vec!["web"]), &[("tier", "frontend")], false)]
    #[case::not_in_hit("NotIn", Some(vec!["db"]), &[("app", "web")], true)]
    #[case::not_in_absent_key("NotIn", Some(vec!["db"]), &[("tier", "frontend")], true)]
    #[case::not_in_miss("NotIn", Some(vec!["web"]), &[("app", "web")], false)]
    #[case::exists_hit("Exists", None, &[("app", "web")], true)]
    #[case::exists_miss("Exists", None, &[("tier", "frontend")], false)]
    #[case::does_not_exist_hit("DoesNotExist", None, &[("tier", "frontend")], true)]
    #[case::does_not_exist_miss("DoesNotExist", None, &[("app", "web")], false)]
    fn match_expressions(
        #[case] operator: &str,
        #[case] values: Option<Vec<&str>>,
        #[case] workload: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("app", operator, values)]),
            ..LabelSelector::default()
        };
        assert_eq!(selector.matches(&labels(workload)).unwrap(), expected);
    }

    #[test]
    fn binary_operator_without_values_is_an_error() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("app", "In", None)]),
            ..LabelSelector::default()
        };
        assert_eq!(
            selector.matches(&BTreeMap::new()).unwrap_err(),
            SelectorError::BinaryOperatorWithoutValues {
                operator: "In".to_string()
            }
        );
    }

    #[test]
    fn unknown_operator_is_an_error() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("app", "GreaterThan", Some(vec!["1"]))]),
            ..LabelSelector::default()
        };
        assert_eq!(
            selector.matches(&BTreeMap::new()).unwrap_err(),
            SelectorError::InvalidOperator {
                operator: "GreaterThan".to_string()
            }
        );
    }

    #[test]
    fn query_string_combines_labels_and_expressions() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            match_expressions: Some(vec![
                requirement("tier", "In", Some(vec!["frontend", "backend"])),
                requirement("legacy", "DoesNotExist", None),
            ]),
        };
        assert_eq!(
            selector.to_query_string().unwrap(),
            "app=web,tier in (frontend, backend),!legacy"
        );
    }

    #[test]
    fn specificity_counts_terms() {
        assert_eq!(LabelSelector::default().specificity(), 0);
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web"), ("tier", "frontend")])),
            match_expressions: Some(vec![requirement("legacy", "DoesNotExist", None)]),
        };
        assert_eq!(selector.specificity(), 3);
    }
}
