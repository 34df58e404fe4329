use std::future::Future;

use crate::error::MigrationResult;

/// A durable key-value tree with `/`-separated keys.
///
/// Writes are last-write-wins. A read returns the most recent completed write.
pub trait Registry: Clone + Send + Sync + 'static {
    fn put(&self, key: &str, value: String) -> impl Future<Output = MigrationResult<()>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = MigrationResult<Option<String>>> + Send;

    /// Deletes `prefix` and every key below it.
    fn delete_tree(&self, prefix: &str) -> impl Future<Output = MigrationResult<()>> + Send;

    /// Returns the names of the direct children of `prefix`, sorted.
    fn children(&self, prefix: &str) -> impl Future<Output = MigrationResult<Vec<String>>> + Send;
}

/// Extracts the direct child names of `prefix` from a set of keys.
pub(crate) fn child_names<'a>(prefix: &str, keys: impl Iterator<Item = &'a str>) -> Vec<String> {
    let parent = format!("{}/", prefix.trim_end_matches('/'));
    let mut names: Vec<String> = keys
        .filter_map(|key| key.strip_prefix(parent.as_str()))
        .filter_map(|rest| rest.split('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();

    names
}

/// Whether `key` is `prefix` or lies below it.
pub(crate) fn in_tree(prefix: &str, key: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_are_direct_and_unique() {
        let keys = [
            "/pipeline/jobs/a/config",
            "/pipeline/jobs/a/info",
            "/pipeline/jobs/b/config",
            "/pipeline/jobsx/c",
        ];

        let names = child_names("/pipeline/jobs", keys.into_iter());

        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn tree_membership_respects_segment_boundaries() {
        assert!(in_tree("/pipeline/jobs/a", "/pipeline/jobs/a"));
        assert!(in_tree("/pipeline/jobs/a", "/pipeline/jobs/a/offsets/0"));
        assert!(!in_tree("/pipeline/jobs/a", "/pipeline/jobs/ab/config"));
    }
}
