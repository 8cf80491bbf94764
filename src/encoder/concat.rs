//! Concat demuxer list handling.

use std::path::{Path, PathBuf};

/// Renders the ffmpeg concat demuxer list for `parts`, in order.
pub fn concat_list_contents(parts: &[PathBuf]) -> String {
    let mut contents = String::from("ffconcat version 1.0\n");
    for part in parts {
        contents.push_str("file '");
        contents.push_str(&escape_path(part));
        contents.push_str("'\n");
    }
    contents
}

/// Writes the concat list to `list`.
pub async fn write_concat_list(list: &Path, parts: &[PathBuf]) -> std::io::Result<()> {
    if let Some(parent) = list.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(list, concat_list_contents(parts)).await
}

/// Quotes a path for a single-quoted concat directive.
fn escape_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "'\\''")
}
