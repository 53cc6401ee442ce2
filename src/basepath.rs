//! Resolution of paths relative to the directory of the running binary.
//!
//! Configured script and logfile paths may be relative; they are interpreted
//! relative to where the binary lives, not the current working directory.

use std::path::{Component, Path, PathBuf};

/// Returns an absolute path for `file`. Relative paths are joined onto the
/// binary's directory; the result is lexically normalized. Absolute paths
/// pass through (normalized as well).
pub fn with(file: &str) -> String {
    let path = Path::new(file);

    if path.is_absolute() {
        return clean(path);
    }

    match binary_dir() {
        Some(dir) => clean(&dir.join(path)),
        None => file.to_string(),
    }
}

fn binary_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(Path::to_path_buf)
}

// Lexical normalization: resolves `.` and `..` without touching the
// filesystem, like Go's filepath.Clean.
fn clean(path: &Path) -> String {
    let mut parts: Vec<Component> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                match parts.last() {
                    Some(Component::Normal(_)) => {
                        parts.pop();
                    }
                    Some(Component::RootDir) => {}
                    _ => parts.push(component),
                }
            }
            other => parts.push(other),
        }
    }

    let mut cleaned = PathBuf::new();
    for part in parts {
        cleaned.push(part.as_os_str());
    }

    cleaned.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_against_binary_dir() {
        let dir = binary_dir().unwrap();
        let expected = dir.join("testfile").to_string_lossy().into_owned();
        assert_eq!(with("./testfile"), expected);
    }

    #[test]
    fn keeps_absolute_paths() {
        assert_eq!(with("/tmp/file"), "/tmp/file");
    }

    #[test]
    fn normalizes_parent_components() {
        assert_eq!(with("/tmp/foo/../testfile"), "/tmp/testfile");
    }
}
