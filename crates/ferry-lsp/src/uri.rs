//! File-path / URI conversions.
//!
//! Tool output speaks in paths, editors speak in `file:` URIs. Relative
//! tool paths are resolved against the recipe's root before conversion.

use std::path::{Path, PathBuf};

use tower_lsp::lsp_types::Url;

/// The filesystem path behind a `file:` URI, forward-slashed.
pub fn uri_to_path(uri: &Url) -> Option<PathBuf> {
    uri.to_file_path().ok()
}

/// A `file:` URI for an absolute path.
pub fn path_to_uri(path: &Path) -> Option<Url> {
    Url::from_file_path(path).ok()
}

/// URI for a path a tool reported: absolute paths convert directly,
/// relative ones are joined to `root` first.
pub fn tool_path_to_uri(path: &str, root: Option<&Path>) -> Option<Url> {
    let path = Path::new(path);
    if path.is_absolute() {
        path_to_uri(path)
    } else {
        path_to_uri(&root?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_roundtrip() {
        let uri = Url::parse("file:///tmp/project/main.rs").unwrap();
        let path = uri_to_path(&uri).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/project/main.rs"));
        assert_eq!(path_to_uri(&path).unwrap(), uri);
    }

    #[test]
    #[cfg(unix)]
    fn test_tool_path_resolution() {
        let root = PathBuf::from("/work/repo");
        assert_eq!(
            tool_path_to_uri("src/lib.rs", Some(&root)).unwrap().path(),
            "/work/repo/src/lib.rs"
        );
        assert_eq!(
            tool_path_to_uri("/abs/x.c", Some(&root)).unwrap().path(),
            "/abs/x.c"
        );
        assert_eq!(tool_path_to_uri("relative.c", None), None);
    }

    #[test]
    fn test_non_file_uri_rejected() {
        let uri = Url::parse("https://example.com/a.rs").unwrap();
        assert!(uri_to_path(&uri).is_none());
    }
}
