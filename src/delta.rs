use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::{CancelToken, Deadline};
use crate::error::{Result, UpgradeError};
use crate::rolling::RollingChecksum;

/// Patch blob envelope: magic, the block size used at encode time (little
/// endian KiB), then zstd-compressed bincode of the chunk list. Carrying the
/// block size makes decode self-contained.
pub const DELTA_MAGIC: &[u8; 8] = b"UPDELTA1";
const HEADER_LEN: usize = DELTA_MAGIC.len() + 4;

pub const MIN_BLOCK_KIB: u32 = 1;
pub const MAX_BLOCK_KIB: u32 = 16 * 1024;
pub const DEFAULT_BLOCK_KIB: u32 = 4;

/// Candidate sequence for the adaptive block-size search, in KiB.
pub const BLOCK_CANDIDATES_KIB: [u32; 15] = [
    1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384,
];

/// Check/cancel cadence while scanning, in bytes of input consumed.
const CHECK_INTERVAL: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Chunk {
    Copy { offset: u64, len: u64 },
    Insert { data: Vec<u8> },
}

/// Wall-clock budgets for a single encode or decode operation.
#[derive(Debug, Clone, Copy)]
pub struct DeltaLimits {
    pub encode_budget: Duration,
    pub decode_budget: Duration,
}

impl Default for DeltaLimits {
    fn default() -> Self {
        Self {
            encode_budget: Duration::from_secs(5 * 60),
            decode_budget: Duration::from_secs(10 * 60),
        }
    }
}

fn check_block_kib(block_kib: u32) -> std::result::Result<usize, String> {
    if (MIN_BLOCK_KIB..=MAX_BLOCK_KIB).contains(&block_kib) {
        Ok(block_kib as usize * 1024)
    } else {
        Err(format!(
            "block size {block_kib} KiB outside {MIN_BLOCK_KIB}..={MAX_BLOCK_KIB}"
        ))
    }
}

/// Produce a patch blob that rebuilds `new` from `old` at the given block
/// granularity. Bounded by `deadline`; observes `cancel` at chunk boundaries.
pub fn encode(
    old: &[u8],
    new: &[u8],
    block_kib: u32,
    deadline: &Deadline,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    let block = check_block_kib(block_kib).map_err(UpgradeError::DeltaEncode)?;

    let chunks = compute_chunks(old, new, block, deadline, cancel)?;

    let encoded =
        bincode::serialize(&chunks).map_err(|e| UpgradeError::DeltaEncode(e.to_string()))?;
    let compressed =
        zstd::bulk::compress(&encoded, 3).map_err(|e| UpgradeError::DeltaEncode(e.to_string()))?;

    let mut blob = Vec::with_capacity(HEADER_LEN + compressed.len());
    blob.extend_from_slice(DELTA_MAGIC);
    blob.extend_from_slice(&block_kib.to_le_bytes());
    blob.extend_from_slice(&compressed);
    Ok(blob)
}

/// Rebuild the target bytes from `old` and a patch blob produced by
/// [`encode`]. The block size travels in the blob header; no out-of-band
/// parameter is needed.
pub fn decode(
    old: &[u8],
    patch: &[u8],
    deadline: &Deadline,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    embedded_block_kib(patch)?;

    let decoder = zstd::Decoder::new(&patch[HEADER_LEN..])
        .map_err(|e| UpgradeError::DeltaDecode(e.to_string()))?;
    let chunks: Vec<Chunk> =
        bincode::deserialize_from(decoder).map_err(|e| UpgradeError::DeltaDecode(e.to_string()))?;

    let estimated: u64 = chunks
        .iter()
        .map(|c| match c {
            Chunk::Copy { len, .. } => *len,
            Chunk::Insert { data } => data.len() as u64,
        })
        .sum();
    let mut out = Vec::with_capacity(estimated as usize);

    for chunk in &chunks {
        deadline.check()?;
        cancel.checkpoint()?;
        match chunk {
            Chunk::Copy { offset, len } => {
                let start = *offset as usize;
                let end = start
                    .checked_add(*len as usize)
                    .ok_or_else(|| UpgradeError::DeltaDecode("copy length overflow".into()))?;
                if end > old.len() {
                    return Err(UpgradeError::DeltaDecode(format!(
                        "copy range {start}..{end} exceeds base length {}",
                        old.len()
                    )));
                }
                out.extend_from_slice(&old[start..end]);
            }
            Chunk::Insert { data } => out.extend_from_slice(data),
        }
    }
    Ok(out)
}

/// Read the block size recorded in a patch blob header.
pub fn embedded_block_kib(patch: &[u8]) -> Result<u32> {
    if patch.len() < HEADER_LEN || &patch[..DELTA_MAGIC.len()] != DELTA_MAGIC {
        return Err(UpgradeError::DeltaDecode("missing delta magic header".into()));
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&patch[DELTA_MAGIC.len()..HEADER_LEN]);
    let block_kib = u32::from_le_bytes(raw);
    check_block_kib(block_kib).map_err(UpgradeError::DeltaDecode)?;
    Ok(block_kib)
}

/// Search the candidate block sizes for the smallest patch.
///
/// Patch size is empirically unimodal in block size on real files, so the
/// search stops at the first strictly larger patch after the running minimum.
/// A zero-byte candidate is a codec incompatibility and never wins.
pub fn search_best_block(
    old: &[u8],
    new: &[u8],
    limits: &DeltaLimits,
    cancel: &CancelToken,
) -> Result<(u32, Vec<u8>)> {
    let mut best: Option<(u32, Vec<u8>)> = None;

    for &candidate in BLOCK_CANDIDATES_KIB.iter() {
        cancel.checkpoint()?;
        let deadline = Deadline::after(limits.encode_budget);
        let patch = match encode(old, new, candidate, &deadline, cancel) {
            Ok(p) => p,
            Err(e @ UpgradeError::DeltaTimeout { .. }) | Err(e @ UpgradeError::Cancelled) => {
                return Err(e)
            }
            Err(e) => {
                tracing::debug!(block_kib = candidate, error = %e, "candidate failed, skipping");
                continue;
            }
        };
        if patch.is_empty() {
            tracing::debug!(block_kib = candidate, "empty patch, skipping candidate");
            continue;
        }

        match &best {
            Some((_, best_patch)) if patch.len() > best_patch.len() => break,
            Some((_, best_patch)) if patch.len() >= best_patch.len() => {}
            _ => best = Some((candidate, patch)),
        }
    }

    best.ok_or_else(|| UpgradeError::DeltaEncode("no block size candidate succeeded".into()))
}

fn compute_chunks(
    old: &[u8],
    new: &[u8],
    block: usize,
    deadline: &Deadline,
    cancel: &CancelToken,
) -> Result<Vec<Chunk>> {
    if new.is_empty() {
        return Ok(vec![]);
    }
    if old.is_empty() || new.len() < block {
        return Ok(vec![Chunk::Insert {
            data: new.to_vec(),
        }]);
    }

    let signatures = block_signatures(old, block);
    let mut table: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        table.entry(sig.weak).or_default().push(idx);
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut insert_buf: Vec<u8> = Vec::new();
    let mut rolling = RollingChecksum::from_window(&new[..block]);
    let mut pos: usize = 0;
    let mut since_check: usize = 0;

    while pos + block <= new.len() {
        if since_check >= CHECK_INTERVAL {
            deadline.check()?;
            cancel.checkpoint()?;
            since_check = 0;
        }

        let window = &new[pos..pos + block];
        if let Some((offset, len)) = find_match(rolling.value(), window, old, &table, &signatures) {
            if !insert_buf.is_empty() {
                chunks.push(Chunk::Insert {
                    data: std::mem::take(&mut insert_buf),
                });
            }
            chunks.push(Chunk::Copy { offset, len });
            pos += len as usize;
            since_check += len as usize;
            if pos + block <= new.len() {
                rolling = RollingChecksum::from_window(&new[pos..pos + block]);
            }
        } else {
            insert_buf.push(new[pos]);
            pos += 1;
            since_check += 1;
            if pos + block <= new.len() {
                rolling.slide(new[pos - 1], new[pos + block - 1]);
            }
        }
    }

    if pos < new.len() {
        insert_buf.extend_from_slice(&new[pos..]);
    }
    if !insert_buf.is_empty() {
        chunks.push(Chunk::Insert { data: insert_buf });
    }

    Ok(chunks)
}

struct BlockSignature {
    weak: u32,
    strong: blake3::Hash,
    offset: u64,
}

fn block_signatures(data: &[u8], block: usize) -> Vec<BlockSignature> {
    let count = data.len().div_ceil(block);
    let mut sigs = Vec::with_capacity(count);
    for i in 0..count {
        let start = i * block;
        let end = (start + block).min(data.len());
        let slice = &data[start..end];
        sigs.push(BlockSignature {
            weak: RollingChecksum::from_window(slice).value(),
            strong: blake3::hash(slice),
            offset: start as u64,
        });
    }
    sigs
}

fn find_match(
    weak: u32,
    window: &[u8],
    old: &[u8],
    table: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Option<(u64, u64)> {
    let candidates = table.get(&weak)?;
    let strong = blake3::hash(window);
    for &idx in candidates {
        let sig = &signatures[idx];
        if sig.strong == strong {
            let end = (sig.offset as usize + window.len()).min(old.len());
            let len = end - sig.offset as usize;
            // Only full-window matches are sound: a shorter trailing block
            // has a different strong hash and never lands here.
            if len == window.len() {
                return Some((sig.offset, len as u64));
            }
        }
    }
    None
}
