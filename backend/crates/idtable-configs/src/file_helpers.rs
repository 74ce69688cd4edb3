//! Path helpers shared by config normalization.

use std::path::{Path, PathBuf};

/// Turn a relative directory path into an absolute one rooted at the current
/// working directory. Absolute paths and empty strings are returned as-is.
pub fn normalize_dir_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return path.to_string();
    }
    let joined: PathBuf = match std::env::current_dir() {
        Ok(cwd) => cwd.join(p),
        Err(_) => return path.to_string(),
    };
    joined.to_string_lossy().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_path_unchanged() {
        assert_eq!(normalize_dir_path("/var/lib/idtable"), "/var/lib/idtable");
    }

    #[test]
    fn test_relative_path_made_absolute() {
        let normalized = normalize_dir_path("./data");
        assert!(Path::new(&normalized).is_absolute());
        assert!(normalized.ends_with("data"));
    }

    #[test]
    fn test_empty_path() {
        assert_eq!(normalize_dir_path(""), "");
    }
}
