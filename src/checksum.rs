//! Hashing utilities for the push pipeline and the file-list schema.
//!
//! The wire contract is MD5 (legacy compatibility with the file server);
//! do not change the algorithm without a wire-format bump.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use crate::contract::HashValue;

const READ_BUF_SIZE: usize = 4 * 1024 * 1024;

/// Streaming lowercase-hex MD5 of a file body.
pub fn md5_hex_file(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open for hash {}", path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = f.read(&mut buf).context("read for hash")?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Cumulative MD5 checkpoints across fixed-size chunks.
///
/// Emits up to `checkpoint_count` evenly spaced prefix hashes; the final
/// entry is always the whole-file hash at `offset == size`, so
/// `result.last()` equals [`md5_hex_file`]. Empty files yield no
/// checkpoints.
pub fn checkpoint_hashes(
    path: &Path,
    chunk_size: u64,
    checkpoint_count: usize,
) -> Result<Vec<HashValue>> {
    let mut f =
        File::open(path).with_context(|| format!("open for checkpoints {}", path.display()))?;
    let size = f.metadata().context("stat for checkpoints")?.len();
    if size == 0 || chunk_size == 0 {
        return Ok(Vec::new());
    }

    let total_chunks = size.div_ceil(chunk_size);
    let count = (checkpoint_count as u64).clamp(1, total_chunks);
    let mut offsets = Vec::with_capacity(count as usize);
    for k in 1..=count {
        let chunk_index = total_chunks * k / count;
        let offset = (chunk_index * chunk_size).min(size);
        if offsets.last() != Some(&offset) {
            offsets.push(offset);
        }
    }
    // The last checkpoint is the full file.
    if offsets.last() != Some(&size) {
        offsets.push(size);
    }

    let mut out = Vec::with_capacity(offsets.len());
    let mut ctx = md5::Context::new();
    let mut consumed: u64 = 0;
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut next = offsets.iter().copied();
    let mut target = next.next().unwrap_or(size);
    loop {
        while consumed == target {
            out.push(HashValue {
                offset: target,
                hash: format!("{:x}", ctx.clone().compute()),
            });
            match next.next() {
                Some(t) => target = t,
                None => return Ok(out),
            }
        }
        let want = ((target - consumed) as usize).min(buf.len());
        let n = f.read(&mut buf[..want]).context("read for checkpoints")?;
        if n == 0 {
            // File shrank underneath us; hash what was read.
            out.push(HashValue {
                offset: consumed,
                hash: format!("{:x}", ctx.clone().compute()),
            });
            return Ok(out);
        }
        ctx.consume(&buf[..n]);
        consumed += n as u64;
    }
}
