//! Resource name parsing and formatting.
//!
//! Resource names are hierarchical strings of the form
//! `type/id(/type/id)*`, e.g. `apps/app1`, `apps/app1/releases/r1`,
//! `apps/app1/releases/r1/scale/s1`. Handlers pull a single segment out of
//! a name by keyword (`segment`) and build names back up (`format`).

use crate::error::ControllerError;

/// Split a resource name into its `/`-separated segments.
fn segments(name: &str) -> Vec<&str> {
    name.split('/').filter(|s| !s.is_empty()).collect()
}

/// Extract the id that follows `keyword` in a resource name.
///
/// `apps/app1/releases/r1` with keyword `releases` yields `r1`. Returns
/// `None` if the keyword does not appear, or appears without a following
/// segment.
pub fn segment(name: &str, keyword: &str) -> Option<String> {
    let parts = segments(name);
    parts
        .iter()
        .position(|s| *s == keyword)
        .and_then(|i| parts.get(i + 1))
        .map(|s| s.to_string())
}

/// Extract the id that follows `keyword`, failing with `invalid-argument`
/// if absent. Used by handlers that cannot proceed without the id.
pub fn require_segment(name: &str, keyword: &str) -> Result<String, ControllerError> {
    segment(name, keyword).ok_or_else(|| {
        ControllerError::invalid_argument(format!(
            "resource name {name:?} has no {keyword} segment"
        ))
    })
}

/// Build `apps/{app_id}`.
pub fn app_name(app_id: &str) -> String {
    format!("apps/{app_id}")
}

/// Build `apps/{app_id}/releases/{release_id}`.
pub fn release_name(app_id: &str, release_id: &str) -> String {
    format!("apps/{app_id}/releases/{release_id}")
}

/// Build `apps/{app_id}/releases/{release_id}/scale/{scale_id}`.
pub fn scale_name(app_id: &str, release_id: &str, scale_id: &str) -> String {
    format!("apps/{app_id}/releases/{release_id}/scale/{scale_id}")
}

/// Build `apps/{app_id}/deployments/{deployment_id}`.
pub fn deployment_name(app_id: &str, deployment_id: &str) -> String {
    format!("apps/{app_id}/deployments/{deployment_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_innermost_segment() {
        assert_eq!(
            segment("apps/app1/releases/r1/scale/s1", "scale"),
            Some("s1".to_string())
        );
        assert_eq!(
            segment("apps/app1/releases/r1/scale/s1", "releases"),
            Some("r1".to_string())
        );
        assert_eq!(segment("apps/app1", "apps"), Some("app1".to_string()));
    }

    #[test]
    fn missing_keyword_is_none() {
        assert_eq!(segment("apps/app1", "releases"), None);
        assert_eq!(segment("", "apps"), None);
    }

    #[test]
    fn require_segment_errors_on_missing_keyword() {
        assert!(require_segment("apps/app1", "releases").is_err());
    }

    #[test]
    fn formatters_round_trip_through_segment() {
        let name = scale_name("app1", "r1", "s1");
        assert_eq!(segment(&name, "apps"), Some("app1".to_string()));
        assert_eq!(segment(&name, "releases"), Some("r1".to_string()));
        assert_eq!(segment(&name, "scale"), Some("s1".to_string()));
    }
}
