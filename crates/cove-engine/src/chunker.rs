//! Content-defined chunking with a gear rolling hash.
//!
//! Cut points depend on content, not offsets, so an insertion near the
//! start of a file shifts only the chunks it touches — the rest keep their
//! plaintext hashes and dedup against chunks already in the store.
//!
//! The gear table is derived once from BLAKE3 XOF output of a fixed label,
//! so every node computes identical cut points without shipping a table.

use std::sync::OnceLock;

/// Chunk size policy. `target` must be a power of two; the mask derived
/// from it gives a mean chunk size of roughly `target` bytes.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerParams {
    pub min: usize,
    pub target: usize,
    pub max: usize,
}

impl Default for ChunkerParams {
    fn default() -> Self {
        Self {
            min: 16 * 1024,
            target: 64 * 1024,
            max: 256 * 1024,
        }
    }
}

impl ChunkerParams {
    fn mask(&self) -> u64 {
        (self.target.next_power_of_two() as u64) - 1
    }
}

const GEAR_LABEL: &[u8] = b"cove v1 gear table";

fn gear_table() -> &'static [u64; 256] {
    static TABLE: OnceLock<[u64; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut raw = [0u8; 256 * 8];
        blake3::Hasher::new()
            .update(GEAR_LABEL)
            .finalize_xof()
            .fill(&mut raw);
        let mut table = [0u64; 256];
        for (i, chunk) in raw.chunks_exact(8).enumerate() {
            table[i] = u64::from_le_bytes(chunk.try_into().unwrap());
        }
        table
    })
}

/// Split `data` into content-defined chunks.
///
/// Empty input yields no chunks; input of at most `min` bytes is a single
/// chunk. Every chunk except possibly the last is between `min` and `max`
/// bytes. Deterministic: same bytes and params, same cut points.
pub fn split<'a>(data: &'a [u8], params: &ChunkerParams) -> Vec<&'a [u8]> {
    let table = gear_table();
    let mask = params.mask();

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < data.len() {
        let remaining = data.len() - start;
        if remaining <= params.min {
            chunks.push(&data[start..]);
            break;
        }

        let limit = remaining.min(params.max);
        let mut hash = 0u64;
        let mut cut = limit;

        for (i, &byte) in data[start..start + limit].iter().enumerate() {
            hash = (hash << 1).wrapping_add(table[byte as usize]);
            if i + 1 >= params.min && hash & mask == 0 {
                cut = i + 1;
                break;
            }
        }

        chunks.push(&data[start..start + cut]);
        start += cut;
    }

    chunks
}
