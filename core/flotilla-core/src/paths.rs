//! Path normalization for workspace matching.
//!
//! Discovery candidates report workspace paths that may differ from the
//! configured workspace in separator direction, trailing separators, or case
//! (macOS and Windows filesystems are case-insensitive by default). Matching
//! also treats a path and any of its ancestors as the same workspace: an
//! instance started in `/project` serves queries for `/project/src`.

/// Normalizes a path for comparison: forward slashes, a single trailing
/// separator stripped, lowercased on case-insensitive platforms.
pub fn normalize_path(path: &str) -> String {
    let forward = path.replace('\\', "/");
    let trimmed = forward.strip_suffix('/').unwrap_or(&forward);
    apply_case_normalization(trimmed)
}

/// True when the two paths refer to the same workspace, or one is a proper
/// ancestor of the other. Empty inputs (after normalization) never match.
pub fn paths_match(a: &str, b: &str) -> bool {
    let a = normalize_path(a);
    let b = normalize_path(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    a.starts_with(&format!("{b}/")) || b.starts_with(&format!("{a}/"))
}

/// Filesystems on macOS (HFS+/APFS) and Windows (NTFS) are case-insensitive
/// by default, so paths are lowercased there for comparison.
fn apply_case_normalization(path: &str) -> String {
    #[cfg(any(target_os = "macos", target_os = "windows"))]
    {
        path.to_lowercase()
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_paths_match() {
        assert!(paths_match("/a/b", "/a/b"));
    }

    #[test]
    fn ancestor_matches_in_both_directions() {
        assert!(paths_match("/a/b", "/a"));
        assert!(paths_match("/a", "/a/b"));
    }

    #[test]
    fn siblings_do_not_match() {
        assert!(!paths_match("/a/b", "/a/c"));
    }

    #[test]
    fn empty_input_never_matches() {
        assert!(!paths_match("", "/a"));
        assert!(!paths_match("/a", ""));
        assert!(!paths_match("", ""));
    }

    #[test]
    fn prefix_without_separator_is_not_ancestry() {
        // "/app" is not an ancestor of "/apple".
        assert!(!paths_match("/apple", "/app"));
    }

    #[test]
    fn trailing_separator_is_stripped() {
        assert!(paths_match("/a/b/", "/a/b"));
        assert_eq!(normalize_path("/a/b/"), "/a/b");
    }

    #[test]
    fn backslashes_are_normalized() {
        assert!(paths_match("C:\\work\\proj", "C:/work/proj"));
    }

    #[cfg(any(target_os = "macos", target_os = "windows"))]
    #[test]
    fn case_insensitive_on_case_folding_platforms() {
        assert!(paths_match("/Users/Dev/Project", "/users/dev/project"));
    }
}
