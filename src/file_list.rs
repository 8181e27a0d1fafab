//! File-list response schema for the server's query endpoint.
//!
//! The HTTP handler itself lives server-side; the monitor consumes its
//! response during SyncOnce, so the schema and its hash-budget rules are
//! built (and tested) here: per-entry snapshot with optional hash and
//! checkpoint hashes, capped per file and cumulatively per request.

use std::path::{Component, Path};

use anyhow::{Context, Result};

use crate::checksum::{checkpoint_hashes, md5_hex_file};
use crate::contract::{ApiResult, FileInfo, FsDirValue};
use crate::protocol::{code, route};

/// Per-file hash cap: at or above this size the hash is omitted.
pub const MAX_HASH_SIZE_SINGLE: u64 = 15 * 1024 * 1024 * 1024;
/// Cumulative hash budget per request; once spent, remaining entries are
/// returned without hash.
pub const MAX_HASH_SIZE_TOTAL: u64 = 500 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub need_hash: bool,
    pub need_checkpoint: bool,
    pub chunk_size: u64,
    pub checkpoint_count: usize,
    pub max_hash_single: u64,
    pub max_hash_total: u64,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            need_hash: false,
            need_checkpoint: false,
            chunk_size: 4 * 1024 * 1024,
            checkpoint_count: 10,
            max_hash_single: MAX_HASH_SIZE_SINGLE,
            max_hash_total: MAX_HASH_SIZE_TOTAL,
        }
    }
}

/// Validate and normalize the `path` query parameter. The path must be
/// root-qualified with the `source` or `dest` prefix; the cleaned relative
/// remainder is returned.
pub fn validate_query_path(path: &str) -> std::result::Result<String, ApiResult> {
    if !has_route_prefix(path) {
        return Err(ApiResult::error(
            code::BAD_PREFIX,
            "must start with source or dest",
        ));
    }
    let cleaned = clean_path(path);
    if !has_route_prefix(&cleaned) {
        return Err(ApiResult::error(code::INVALID_PATH, "invalid path"));
    }
    let lower = cleaned.to_ascii_lowercase();
    let rel = if lower.starts_with(route::SOURCE_PREFIX) {
        &cleaned[route::SOURCE_PREFIX.len()..]
    } else if lower.starts_with(route::DEST_PREFIX) {
        &cleaned[route::DEST_PREFIX.len()..]
    } else {
        &cleaned
    };
    Ok(rel.trim_start_matches('/').to_string())
}

fn has_route_prefix(path: &str) -> bool {
    let lower = path.trim_start_matches('/').to_ascii_lowercase();
    lower.starts_with(route::SOURCE_PREFIX) || lower.starts_with(route::DEST_PREFIX)
}

/// Lexical clean: forward slashes, no `.`/`..` components escaping the root.
fn clean_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for comp in Path::new(&normalized).components() {
        match comp {
            Component::Normal(s) => parts.push(s.to_str().unwrap_or("")),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts.join("/")
}

/// Snapshot one directory level under `root`, applying the hash budgets.
/// A non-directory path yields an empty list, matching the endpoint.
pub fn read_dir_entries(root: &Path, rel: &str, opts: &ListOptions) -> Result<Vec<FileInfo>> {
    let dir = root.join(rel);
    let meta = std::fs::metadata(&dir)
        .with_context(|| format!("open path {}", dir.display()))?;
    if !meta.is_dir() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let mut hashed_total: u64 = 0;
    let entries = std::fs::read_dir(&dir)
        .with_context(|| format!("read dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry.context("read dir entry")?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let full = entry.path();
        let md = std::fs::symlink_metadata(&full)
            .with_context(|| format!("stat {}", full.display()))?;
        let is_dir = md.is_dir();
        let size = if is_dir { 0 } else { md.len() };
        let (c_time, a_time, m_time) = file_times(&md);

        let mut hash = String::new();
        let mut hash_values = Vec::new();
        let want_hash = opts.need_hash || opts.need_checkpoint;
        if !is_dir
            && !md.is_symlink()
            && want_hash
            && hashed_total < opts.max_hash_total
            && size < opts.max_hash_single
        {
            if opts.need_checkpoint {
                hash_values = checkpoint_hashes(&full, opts.chunk_size, opts.checkpoint_count)
                    .unwrap_or_default();
            }
            if opts.need_hash {
                if let Some(last) = hash_values.last() {
                    hash = last.hash.clone();
                } else {
                    hash = md5_hex_file(&full).unwrap_or_default();
                }
            }
            hashed_total += size;
        }

        out.push(FileInfo {
            path: name,
            is_dir: FsDirValue::from_bool(is_dir),
            size: size as i64,
            hash,
            hash_values,
            c_time,
            a_time,
            m_time,
            link_to: read_link_target(&full, &md),
        });
    }
    Ok(out)
}

fn read_link_target(path: &Path, md: &std::fs::Metadata) -> String {
    if !md.is_symlink() {
        return String::new();
    }
    match std::fs::read_link(path) {
        Ok(target) => target.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "read link error");
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        }
    }
}

/// (ctime, atime, mtime) as Unix seconds.
pub fn file_times(md: &std::fs::Metadata) -> (i64, i64, i64) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        (md.ctime(), md.atime(), md.mtime())
    }
    #[cfg(not(unix))]
    {
        fn secs(t: std::io::Result<std::time::SystemTime>) -> i64 {
            t.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or_else(|| chrono::Utc::now().timestamp())
        }
        (secs(md.created()), secs(md.accessed()), secs(md.modified()))
    }
}
