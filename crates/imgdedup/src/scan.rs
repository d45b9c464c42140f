//! Filesystem discovery and content signatures.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use imgdedup_core::models::ContentSignature;

use crate::config::IndexConfig;

/// Every indexable image file under `root`, as absolute paths in sorted
/// order.
pub fn scan_images(root: &Path, config: &IndexConfig) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        bail!("Index root does not exist: {}", root.display());
    }
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", root.display()))?;

    let mut default_excludes = vec!["**/.git/**".to_string(), "**/.*/**".to_string()];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let extensions: Vec<String> = config
        .extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();

    let mut files = Vec::new();
    let walker = WalkDir::new(&root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        if exclude_set.is_match(relative) {
            continue;
        }

        let matches_ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|e| extensions.iter().any(|want| *want == e));
        if !matches_ext {
            continue;
        }

        files.push(path.to_path_buf());
    }

    files.sort();
    Ok(files)
}

/// Size, modification time, and SHA-256 of one file.
pub fn compute_signature(path: &Path) -> Result<ContentSignature> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let mtime_ns = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64;

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(ContentSignature {
        size_bytes: metadata.len(),
        mtime_ns,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn finds_configured_extensions_only() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        fs::write(root.join("a.jpg"), b"a").unwrap();
        fs::write(root.join("nested/b.JPEG"), b"b").unwrap();
        fs::write(root.join("c.png"), b"c").unwrap();
        fs::write(root.join("notes.txt"), b"n").unwrap();
        fs::write(root.join(".cache/d.jpg"), b"d").unwrap();

        let found = scan_images(root, &IndexConfig::default()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.JPEG"]);
        assert!(found.iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn signature_tracks_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.jpg");
        fs::write(&path, b"hello").unwrap();
        let first = compute_signature(&path).unwrap();
        assert_eq!(first.size_bytes, 5);
        assert_eq!(
            first.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        fs::write(&path, b"hello!").unwrap();
        assert_ne!(compute_signature(&path).unwrap().sha256, first.sha256);
    }

    #[test]
    fn missing_root_is_an_error() {
        assert!(scan_images(Path::new("/definitely/not/here"), &IndexConfig::default()).is_err());
    }
}
