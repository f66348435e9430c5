use std::path::{Component, Path, PathBuf};
use crate::models::EngineError;

/// Collapses `.` and `..` without touching the filesystem, so paths that do not
/// exist yet can still be compared.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolves user input against the managed root. Relative input is joined to
/// `base`; the result must stay inside `base`.
pub fn safe_join(base: &Path, input: &str) -> Result<PathBuf, EngineError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation("Path must not be empty"));
    }

    let candidate = Path::new(trimmed);
    let joined = if candidate.is_absolute() { candidate.to_path_buf() } else { base.join(candidate) };
    let path = normalize(&joined);

    if !path.starts_with(normalize(base)) {
        return Err(EngineError::validation(format!("Path escapes the managed folder: {}", input)));
    }
    Ok(path)
}

/// `true` when `a` equals `b` or is one of its ancestors.
pub fn is_ancestor_or_equal(a: &Path, b: &Path) -> bool {
    b.starts_with(a)
}

/// `true` when one path contains the other (or they are the same path).
pub fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// A single file name with no separators or traversal.
pub fn validate_file_name(name: &str) -> Result<(), EngineError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(EngineError::validation(format!("Invalid name: {:?}", name)));
    }
    if trimmed.contains('/') || trimmed.contains('\\') {
        return Err(EngineError::validation(format!("Name must not contain path separators: {}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_join_relative() {
        let base = PathBuf::from("/home/u/Desktop");
        let joined = safe_join(&base, "work/notes.txt").unwrap();
        assert_eq!(joined, PathBuf::from("/home/u/Desktop/work/notes.txt"));
    }

    #[test]
    fn test_safe_join_rejects_traversal() {
        let base = PathBuf::from("/home/u/Desktop");
        let result = safe_join(&base, "../Documents/secret.txt");
        assert!(matches!(result, Err(EngineError::ValidationError(_))));
        assert!(safe_join(&base, "/etc/passwd").is_err());
    }

    #[test]
    fn test_safe_join_accepts_absolute_inside_root() {
        let base = PathBuf::from("/home/u/Desktop");
        assert_eq!(
            safe_join(&base, "/home/u/Desktop/a/../b.txt").unwrap(),
            PathBuf::from("/home/u/Desktop/b.txt")
        );
    }

    #[test]
    fn test_overlaps() {
        assert!(overlaps(Path::new("/d/work"), Path::new("/d/work/a.txt")));
        assert!(overlaps(Path::new("/d/work/a.txt"), Path::new("/d/work")));
        assert!(!overlaps(Path::new("/d/work"), Path::new("/d/workshop")));
        assert!(is_ancestor_or_equal(Path::new("/d"), Path::new("/d/x")));
        assert!(!is_ancestor_or_equal(Path::new("/d/x"), Path::new("/d")));
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("report.txt").is_ok());
        assert!(validate_file_name("../x").is_err());
        assert!(validate_file_name("a/b").is_err());
        assert!(validate_file_name("  ").is_err());
    }
}
