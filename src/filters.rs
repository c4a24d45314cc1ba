//! Filter evaluation shared by every list+stream handler (spec.md §4.5
//! "Filters").
//!
//! Label filters and type filters are evaluated the same way regardless of
//! which RPC is asking: label filters OR together across the filter list,
//! AND together within one filter's expressions (property 4, spec.md §8).

use std::collections::HashMap;

use crate::pb;

/// One `(key, op, values)` clause within a label filter.
#[derive(Debug, Clone)]
pub struct LabelExpr {
    /// Label key to test.
    pub key: String,
    /// Comparison operator.
    pub op: pb::label_filter::expr::Op,
    /// Values to compare against (meaning depends on `op`).
    pub values: Vec<String>,
}

impl LabelExpr {
    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        use pb::label_filter::expr::Op;
        match self.op {
            Op::Eq => labels
                .get(&self.key)
                .is_some_and(|v| self.values.iter().any(|want| want == v)),
            Op::NotEq => !labels
                .get(&self.key)
                .is_some_and(|v| self.values.iter().any(|want| want == v)),
            Op::Exists => labels.contains_key(&self.key),
            Op::NotExists => !labels.contains_key(&self.key),
            Op::Invalid => false,
        }
    }
}

/// One label filter: all of its expressions must match (AND).
#[derive(Debug, Clone, Default)]
pub struct LabelFilter {
    /// Clauses, ANDed together.
    pub exprs: Vec<LabelExpr>,
}

impl LabelFilter {
    /// Build from the wire message.
    pub fn from_pb(pb: &pb::LabelFilter) -> Self {
        LabelFilter {
            exprs: pb
                .expressions
                .iter()
                .map(|e| LabelExpr {
                    key: e.key.clone(),
                    op: e.op(),
                    values: e.values.clone(),
                })
                .collect(),
        }
    }

    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.exprs.iter().all(|e| e.matches(labels))
    }
}

/// A list of label filters: a record matches if it matches *any* of them
/// (OR). An empty list matches everything (spec.md §4.5).
pub fn matches_label_filters(filters: &[LabelFilter], labels: &HashMap<String, String>) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(labels))
}

/// Build [`LabelFilter`]s from the wire representation.
pub fn label_filters_from_pb(pbs: &[pb::LabelFilter]) -> Vec<LabelFilter> {
    pbs.iter().map(LabelFilter::from_pb).collect()
}

/// A type filter over the closed `ReleaseType` set (releases and
/// deployments, spec.md §4.5). Empty accepts everything.
pub fn matches_type_filter(filters: &[i32], release_type: crate::domain::ReleaseType) -> bool {
    if filters.is_empty() {
        return true;
    }
    let want = match release_type {
        crate::domain::ReleaseType::Code => pb::ReleaseType::Code as i32,
        crate::domain::ReleaseType::Config => pb::ReleaseType::Config as i32,
    };
    filters.contains(&want)
}

/// Collect the set of ids named by `keyword` across a list of resource-name
/// filters (spec.md §4.5 "Name filters"). Non-matching names are ignored
/// rather than rejected: a filter naming an unrelated resource type simply
/// contributes nothing.
pub fn object_ids_from_name_filters(name_filters: &[String], keyword: &str) -> Vec<String> {
    name_filters
        .iter()
        .filter_map(|n| crate::names::segment(n, keyword))
        .collect()
}

/// Collect the set of app ids named by any resource-name filter (every
/// resource name in this schema is rooted at `apps/{id}`).
pub fn app_ids_from_name_filters(name_filters: &[String]) -> Vec<String> {
    object_ids_from_name_filters(name_filters, "apps")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn eq_matches_when_value_in_set() {
        let expr = LabelExpr {
            key: "env".into(),
            op: pb::label_filter::expr::Op::Eq,
            values: vec!["prod".into(), "staging".into()],
        };
        assert!(expr.matches(&labels(&[("env", "prod")])));
        assert!(!expr.matches(&labels(&[("env", "dev")])));
        assert!(!expr.matches(&labels(&[])));
    }

    #[test]
    fn not_eq_matches_when_value_absent_or_different() {
        let expr = LabelExpr {
            key: "env".into(),
            op: pb::label_filter::expr::Op::NotEq,
            values: vec!["prod".into()],
        };
        assert!(expr.matches(&labels(&[("env", "dev")])));
        assert!(expr.matches(&labels(&[])));
        assert!(!expr.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn exists_and_not_exists() {
        let exists = LabelExpr {
            key: "env".into(),
            op: pb::label_filter::expr::Op::Exists,
            values: vec![],
        };
        let not_exists = LabelExpr {
            key: "env".into(),
            op: pb::label_filter::expr::Op::NotExists,
            values: vec![],
        };
        assert!(exists.matches(&labels(&[("env", "prod")])));
        assert!(!exists.matches(&labels(&[])));
        assert!(not_exists.matches(&labels(&[])));
        assert!(!not_exists.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn filter_list_empty_matches_everything() {
        assert!(matches_label_filters(&[], &labels(&[])));
    }

    #[test]
    fn filter_list_ors_across_filters_ands_within() {
        let f1 = LabelFilter {
            exprs: vec![
                LabelExpr { key: "env".into(), op: pb::label_filter::expr::Op::Eq, values: vec!["prod".into()] },
                LabelExpr { key: "tier".into(), op: pb::label_filter::expr::Op::Eq, values: vec!["web".into()] },
            ],
        };
        let f2 = LabelFilter {
            exprs: vec![LabelExpr { key: "canary".into(), op: pb::label_filter::expr::Op::Exists, values: vec![] }],
        };
        let filters = vec![f1, f2];

        assert!(matches_label_filters(&filters, &labels(&[("env", "prod"), ("tier", "web")])));
        assert!(matches_label_filters(&filters, &labels(&[("canary", "true")])));
        assert!(!matches_label_filters(&filters, &labels(&[("env", "prod")])));
    }

    #[test]
    fn name_filter_extracts_only_matching_keyword() {
        let names = vec!["apps/a1".to_string(), "apps/a2/releases/r1".to_string()];
        assert_eq!(app_ids_from_name_filters(&names), vec!["a1", "a2"]);
        assert_eq!(
            object_ids_from_name_filters(&names, "releases"),
            vec!["r1"]
        );
    }
}
