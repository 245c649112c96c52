//! Debug dump of rewritten classes

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Write `<dir>/<class>.class`, ignoring any failure
pub fn dump(dir: &Path, class: &str, bytes: &[u8]) {
    match try_dump(dir, class, bytes) {
        Ok(path) => debug!(class, path = %path.display(), "dumped class"),
        Err(err) => debug!(class, error = %err, "debug dump failed"),
    }
}

/// Write `<dir>/<class>.class`, creating parent directories
pub fn try_dump(dir: &Path, class: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    let path = dir.join(format!("{}.class", class));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, bytes)?;
    Ok(path)
}
