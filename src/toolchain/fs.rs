//! Filesystem helpers shared by the toolchain collaborators

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use livesync_core::prelude::*;

/// Dot-prefixed file or directory name
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// Every non-hidden file under `root`, sorted. A file `root` yields itself.
pub fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if root.is_file() {
        files.push(root.to_path_buf());
    } else if root.is_dir() {
        collect_into(root, &mut files)?;
    }
    files.sort();
    Ok(files)
}

fn collect_into(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if is_hidden(&path) {
            continue;
        }
        if path.is_dir() {
            collect_into(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

/// Copy every non-hidden file of `source` into `destination`, keeping the
/// relative layout. Returns the written destination paths.
pub fn copy_tree(source: &Path, destination: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for file in collect_files(source)? {
        let relative = file.strip_prefix(source).unwrap_or(&file);
        let target = destination.join(relative);
        copy_file(&file, &target)?;
        written.push(target);
    }
    Ok(written)
}

pub fn copy_file(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, target)?;
    Ok(())
}

/// Hex MD5 over the names and contents of every file under `inputs`.
///
/// Missing inputs still contribute their path, so creating one changes the
/// fingerprint.
pub fn fingerprint(inputs: &[PathBuf]) -> Result<String> {
    let mut hasher = Md5::new();
    for input in inputs {
        let files = collect_files(input)?;
        if files.is_empty() {
            hasher.update(input.to_string_lossy().as_bytes());
            hasher.update(b"\0missing\0");
            continue;
        }
        for file in files {
            hasher.update(file.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(std::fs::read(&file)?);
            hasher.update(b"\0");
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex MD5 of one file's content
pub fn file_hash(path: &Path) -> Result<String> {
    Ok(hex::encode(Md5::digest(std::fs::read(path)?)))
}
