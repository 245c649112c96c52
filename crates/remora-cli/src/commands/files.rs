//! Class file collection

use std::path::{Path, PathBuf};

/// Collect `.class` files under a path, sorted; a single file is returned as is
pub fn collect_class_files(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if path.is_file() {
        files.push(path.to_path_buf());
    } else if path.is_dir() {
        collect_in_dir(path, &mut files)?;
    } else {
        anyhow::bail!("Input not found: {}", path.display());
    }
    files.sort();
    Ok(files)
}

fn collect_in_dir(dir: &Path, files: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            // Skip hidden dirs
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            collect_in_dir(&path, files)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("class") {
            files.push(path);
        }
    }
    Ok(())
}
