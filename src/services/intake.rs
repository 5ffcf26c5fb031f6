use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::core::record::{identity_from_path, RawPhotoInput};

/// Options for building engine inputs from directories on disk.
#[derive(Debug, Clone)]
pub struct IntakeOptions {
    pub max_depth: Option<usize>,
    /// Compute SHA-256 content digests so byte-identical files share a
    /// cache identity. Costs one read per file.
    pub compute_content_digests: bool,
    /// Lower-case extensions to accept.
    pub supported_extensions: HashSet<String>,
}

impl Default for IntakeOptions {
    fn default() -> Self {
        let supported_extensions = ["jpg", "jpeg", "png", "tiff", "tif", "webp", "bmp", "gif"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            max_depth: None,
            compute_content_digests: false,
            supported_extensions,
        }
    }
}

/// Walk `roots` and build a [`RawPhotoInput`] per supported image file.
///
/// A host convenience: the engine core itself never does file discovery,
/// and hosts with exotic formats hand in pre-decoded buffers instead.
/// Results are sorted by path, so insertion order (and with it keeper
/// tie-breaking) is deterministic for a given tree.
pub fn collect_photo_inputs(roots: &[PathBuf], options: &IntakeOptions) -> Result<Vec<RawPhotoInput>> {
    for root in roots {
        if !root.is_dir() {
            bail!("intake root {} is not a directory", root.display());
        }
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    for root in roots {
        let mut walker = WalkDir::new(root).follow_links(false);
        if let Some(depth) = options.max_depth {
            walker = walker.max_depth(depth);
        }
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(extension) = path.extension() else {
                continue;
            };
            let ext = extension.to_string_lossy().to_lowercase();
            if options.supported_extensions.contains(&ext) {
                paths.push(path.to_path_buf());
            }
        }
    }
    paths.sort();

    let mut identities = Vec::with_capacity(paths.len());
    for path in &paths {
        match identity_from_path(path) {
            Ok(identity) => identities.push(identity),
            Err(e) => log::warn!("skipping {}: {e}", path.display()),
        }
    }

    if options.compute_content_digests {
        let digests: Vec<Option<String>> = identities
            .par_iter()
            .map(|identity| match content_digest(&identity.path) {
                Ok(digest) => Some(digest),
                Err(e) => {
                    log::warn!(
                        "content digest failed for {}, falling back to path identity: {e}",
                        identity.path.display()
                    );
                    None
                }
            })
            .collect();
        for (identity, digest) in identities.iter_mut().zip(digests) {
            identity.content_digest = digest;
        }
    }

    Ok(identities.into_iter().map(RawPhotoInput::from_file).collect())
}

/// SHA-256 of a file's contents via a memory map, as a hex string.
pub fn content_digest(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    let mut hasher = Sha256::new();
    if len > 0 {
        // Empty files cannot be mapped.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mmap {}", path.display()))?;
        hasher.update(&mmap);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
