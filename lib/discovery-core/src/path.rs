//! Path normalization and request-path resolution

/// Enforce a leading `/` and strip trailing `/` characters.
///
/// A path made only of slashes collapses to `/`. An empty string stays empty so
/// that validation can reject it.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let stripped = trimmed.trim_end_matches('/');
    if stripped.is_empty() {
        return "/".to_string();
    }

    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{}", stripped)
    }
}

/// Resolves request paths to registered paths by literal prefix.
///
/// Paths are kept sorted longest first (ties broken lexicographically), so the
/// first prefix hit is the longest one.
#[derive(Clone, Debug, Default)]
pub struct PathMatcher {
    prefixes: Vec<String>,
}

impl PathMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the current key set of the path table
    pub fn from_paths<'a, I>(paths: I) -> Self
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut prefixes: Vec<String> = paths.into_iter().cloned().collect();
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self { prefixes }
    }

    /// Longest registered path that `request_path` starts with
    pub fn resolve(&self, request_path: &str) -> Option<&str> {
        let request = normalize_path(request_path);
        self.prefixes
            .iter()
            .find(|prefix| request.starts_with(prefix.as_str()))
            .map(|prefix| prefix.as_str())
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn paths(&self) -> &[String] {
        &self.prefixes
    }
}
