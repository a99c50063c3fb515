//! Computes the on-disk destination for a completed download (§4.4
//! "Destination path").
//!
//! The peer-supplied path uses backslash separators and usually begins
//! with a `@@<share name>` marker identifying which shared root the file
//! came from, e.g. `@@music\A\B\01.mp3`. That marker component is dropped
//! entirely; everything after it becomes the path under
//! `${downloads_root}/${username}/`.

use std::path::{Path, PathBuf};

/// Computes `downloads_root/username/<sanitized components>` for a
/// peer-reported transfer path. Every component is sanitized independently
/// (§8 "Destination sanitization"): the result never escapes
/// `downloads_root` via `..` or an absolute component, and no component is
/// ever empty.
pub fn compute_destination(downloads_root: &Path, username: &str, peer_path: &str) -> PathBuf {
    let mut dest = downloads_root.join(sanitize_component(username));
    for raw in strip_root_marker(peer_path) {
        dest.push(sanitize_component(raw));
    }
    dest
}

/// Splits a backslash-separated peer path into components, dropping a
/// leading `@@...` share marker if present.
fn strip_root_marker(path: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = path.split('\\').filter(|p| !p.is_empty()).collect();
    if parts.first().map_or(false, |p| p.starts_with("@@")) {
        parts.remove(0);
    }
    parts
}

/// Sanitizes a single path component: strips characters that could be used
/// to escape `downloads_root` or confuse the local filesystem, trims
/// leading dots (defeating `.`/`..`) and surrounding whitespace, and
/// substitutes a placeholder if nothing is left.
fn sanitize_component(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '/' | '\\' | '\0'))
        .collect();
    let trimmed = stripped.trim().trim_start_matches('.').trim();
    if trimmed.is_empty() {
        "unnamed".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_share_marker_and_joins_remainder() {
        let dest = compute_destination(Path::new("/downloads"), "alice", "@@music\\A\\B\\01.mp3");
        assert_eq!(dest, Path::new("/downloads/alice/A/B/01.mp3"));
    }

    #[test]
    fn no_marker_is_still_sanitized_component_by_component() {
        let dest = compute_destination(Path::new("/downloads"), "bob", "folder\\song.flac");
        assert_eq!(dest, Path::new("/downloads/bob/folder/song.flac"));
    }

    #[test]
    fn dot_dot_components_cannot_escape_the_root() {
        let dest = compute_destination(Path::new("/downloads"), "eve", "@@x\\..\\..\\etc\\passwd");
        assert!(dest.starts_with("/downloads/eve"));
        // the two ".." components sanitize down to "unnamed", not "..".
        assert!(!dest.to_string_lossy().contains(".."));
    }

    #[test]
    fn absolute_looking_components_lose_their_drive_and_slashes() {
        let dest = compute_destination(Path::new("/downloads"), "mallory", "@@x\\C:\\Windows\\win.ini");
        assert!(dest.starts_with("/downloads/mallory"));
        assert!(!dest.to_string_lossy().contains(':'));
    }

    #[test]
    fn empty_components_fall_back_to_unnamed() {
        let dest = compute_destination(Path::new("/downloads"), "...", "@@x\\   \\track.mp3");
        assert!(dest.components().all(|c| !c.as_os_str().is_empty()));
        assert!(dest.to_string_lossy().contains("unnamed"));
    }
}
