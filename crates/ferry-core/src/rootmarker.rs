//! Workspace root resolution by marker files.
//!
//! A marker is a glob matched against directory entry names; a trailing
//! `/` restricts the match to directories. Resolution walks upward from
//! the file's directory to the filesystem root and returns the first
//! directory containing any match.

use std::path::{Path, PathBuf};

use glob::Pattern;

/// Walk upward from `fname`'s directory looking for a marker match.
pub fn match_root_path(fname: &Path, markers: &[String]) -> Option<PathBuf> {
    if markers.is_empty() {
        return None;
    }

    let patterns: Vec<(Pattern, bool)> = markers
        .iter()
        .filter_map(|marker| {
            let (name, dir_only) = match marker.strip_suffix('/') {
                Some(stripped) => (stripped, true),
                None => (marker.as_str(), false),
            };
            Pattern::new(name).ok().map(|p| (p, dir_only))
        })
        .collect();

    let mut dir = fname.parent()?.to_path_buf();
    loop {
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                for (pattern, dir_only) in &patterns {
                    if *dir_only != is_dir {
                        continue;
                    }
                    if pattern.matches(name) {
                        return Some(dir);
                    }
                }
            }
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Resolve the root for one recipe: recipe markers first, then the global
/// markers, then the workspace folder containing the file, then the
/// process root path.
pub fn find_root_path(
    fname: &Path,
    recipe_markers: &[String],
    global_markers: &[String],
    folders: &[PathBuf],
    root_path: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(dir) = match_root_path(fname, recipe_markers) {
        return Some(dir);
    }
    if let Some(dir) = match_root_path(fname, global_markers) {
        return Some(dir);
    }

    let fname_lower = fname.to_string_lossy().to_lowercase();
    for folder in folders {
        let folder_str = folder.to_string_lossy();
        if fname_lower.len() > folder_str.len()
            && fname_lower.starts_with(&folder_str.to_lowercase())
        {
            return Some(folder.clone());
        }
    }

    root_path.map(Path::to_path_buf)
}
