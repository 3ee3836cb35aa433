//! Small filesystem utilities.

use globset::{Glob, GlobSet, GlobSetBuilder};

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{RestFuzzError, RestFuzzResult};

/// Resolves CLI description arguments: existing paths are taken as-is, anything
/// else is treated as a glob over the working directory.
pub fn resolve_spec_args(args: &[String]) -> RestFuzzResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut patterns = Vec::new();
    for arg in args {
        if Path::new(arg).is_file() {
            out.push(PathBuf::from(arg));
        } else {
            patterns.push(arg.clone());
        }
    }
    if !patterns.is_empty() {
        out.extend(find_matching_files(Path::new("."), &patterns)?);
    }
    out.dedup();
    Ok(out)
}

pub fn find_matching_files(root: &Path, patterns: &[String]) -> RestFuzzResult<Vec<PathBuf>> {
    let set = compile_globset(patterns)?;
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let msg = e.to_string();
            RestFuzzError::Io(e.into_io_error().unwrap_or_else(|| std::io::Error::other(msg)))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let p = entry.path();
        let rel = p.strip_prefix(root).unwrap_or(p);
        if set.is_match(rel) {
            out.push(root.join(rel));
        }
    }
    out.sort();
    Ok(out)
}

fn compile_globset(patterns: &[String]) -> RestFuzzResult<GlobSet> {
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        let g = Glob::new(p).map_err(|e| RestFuzzError::InvalidArgument(format!("invalid glob {p:?}: {e}")))?;
        b.add(g);
    }
    b.build()
        .map_err(|e| RestFuzzError::InvalidArgument(format!("invalid globset: {e}")))
}
