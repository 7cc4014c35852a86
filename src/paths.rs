//! Sandbox-relative path handling.
//!
//! Every path that reaches a sandbox provider passes through
//! [`validate_relative`]: relative, normalized, no `..`, no NUL.
//! [`normalize_artifact_path`] is the more forgiving front door used by the
//! protocol parser, which also accepts the leading `/` models like to emit.

use std::path::{Component, Path};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),

    #[error("path escapes the sandbox root: {0}")]
    Traversal(String),

    #[error("path contains a NUL byte")]
    NulByte,
}

/// Validate a sandbox path and return its normalized form.
///
/// `./src//App.jsx` becomes `src/App.jsx`. Absolute paths, Windows prefixes
/// and any `..` component are rejected rather than resolved.
pub fn validate_relative(raw: &str) -> Result<String, PathError> {
    if raw.contains('\0') {
        return Err(PathError::NulByte);
    }
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() {
        return Err(PathError::Empty);
    }
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(PathError::Absolute(raw.to_string()));
    }

    let mut segments: Vec<String> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(value) => segments.push(value.to_string_lossy().into_owned()),
            Component::ParentDir => return Err(PathError::Traversal(raw.to_string())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Absolute(raw.to_string()));
            }
        }
    }

    if segments.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(segments.join("/"))
}

/// `C:` and friends. `Component::Prefix` only shows up on Windows hosts.
fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Normalize a path announced by the generation service.
///
/// Leading slashes are stripped (`/src/App.js` → `src/App.js`) before the
/// strict validation applies.
pub fn normalize_artifact_path(raw: &str) -> Result<String, PathError> {
    let trimmed = raw.trim().replace('\\', "/");
    validate_relative(trimmed.trim_start_matches('/'))
}

/// Parent directory of a normalized path, if it has one.
pub fn parent_dir(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| &path[..idx]).filter(|p| !p.is_empty())
}

/// Final path component.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_plain_relative() {
        assert_eq!(validate_relative("src/App.jsx").unwrap(), "src/App.jsx");
    }

    #[test]
    fn test_validate_collapses_dots_and_slashes() {
        assert_eq!(validate_relative("./src//components/./Hero.jsx").unwrap(), "src/components/Hero.jsx");
    }

    #[test]
    fn test_validate_converts_backslashes() {
        assert_eq!(validate_relative("src\\index.css").unwrap(), "src/index.css");
    }

    #[test]
    fn test_validate_rejects_absolute() {
        assert!(matches!(validate_relative("/etc/passwd"), Err(PathError::Absolute(_))));
    }

    #[test]
    fn test_validate_rejects_drive_prefixes() {
        for raw in ["C:/Windows/win.ini", "c:\\x", "D:relative.txt"] {
            assert!(matches!(validate_relative(raw), Err(PathError::Absolute(_))), "{raw}");
        }
        assert!(normalize_artifact_path("/C:/x").is_err());
        assert_eq!(validate_relative("src/a:b.js").unwrap(), "src/a:b.js");
    }

    #[test]
    fn test_validate_rejects_traversal() {
        assert!(matches!(validate_relative("../secrets"), Err(PathError::Traversal(_))));
        assert!(matches!(validate_relative("src/../../x"), Err(PathError::Traversal(_))));
    }

    #[test]
    fn test_validate_rejects_empty_and_nul() {
        assert_eq!(validate_relative(""), Err(PathError::Empty));
        assert_eq!(validate_relative("   "), Err(PathError::Empty));
        assert_eq!(validate_relative("./"), Err(PathError::Empty));
        assert_eq!(validate_relative("a\0b"), Err(PathError::NulByte));
    }

    #[test]
    fn test_normalize_artifact_strips_leading_slash() {
        assert_eq!(normalize_artifact_path("/src/App.js").unwrap(), "src/App.js");
        assert_eq!(normalize_artifact_path("  ./src/App.js ").unwrap(), "src/App.js");
    }

    #[test]
    fn test_normalize_artifact_still_rejects_traversal() {
        assert!(normalize_artifact_path("/../etc/passwd").is_err());
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("src/components/Hero.jsx"), Some("src/components"));
        assert_eq!(parent_dir("index.html"), None);
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("src/components/Hero.jsx"), "Hero.jsx");
        assert_eq!(file_name("package.json"), "package.json");
    }
}
