// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! fs-verity style Merkle tree over 4096-byte blocks.
//!
//! The content (one or more byte regions treated as a single stream) is
//! zero-padded to a block boundary, each block is digested with SHA-256,
//! each level of digests is itself padded to a block boundary and digested
//! again, until a single block remains. The serialized tree stores levels
//! top-down so a verifier can stream it while reading the file.

use sha2::{Digest, Sha256};

pub const VERITY_BLOCK_SIZE: usize = 4096;
const DIGEST_LEN: usize = 32;

/// Salt used for the in-archive verity content digest. The v4 signature
/// tree uses no salt (fs-verity on-device compatibility).
const CONTENT_DIGEST_SALT: [u8; 8] = [0u8; 8];

/// Root hash plus the serialized tree levels (top level first).
pub struct VerityTree {
    pub root_hash: [u8; DIGEST_LEN],
    pub tree: Vec<u8>
}

/// The VERITY_CHUNKED_SHA256 content digest: salted root hash followed by
/// the total content length as a little-endian u64.
pub fn verity_content_digest(regions: &[&[u8]]) -> Vec<u8> {
    let total_len: u64 = regions.iter().map(|r| r.len() as u64).sum();
    let tree = build_verity_tree(regions, &CONTENT_DIGEST_SALT);
    let mut digest = Vec::with_capacity(DIGEST_LEN + 8);
    digest.extend_from_slice(&tree.root_hash);
    digest.extend_from_slice(&total_len.to_le_bytes());
    digest
}

/// Builds the full tree. `salt` is prepended to every digest input; pass
/// an empty slice for the unsalted (v4 / fs-verity) form.
pub fn build_verity_tree(regions: &[&[u8]], salt: &[u8]) -> VerityTree {
    let data_len: usize = regions.iter().map(|r| r.len()).sum();

    // Level sizes from the leaves upwards; a level covering n blocks of
    // source occupies n digests, padded out to a whole number of blocks.
    let mut level_sizes = vec![padded_digests_size(data_len)];
    while *level_sizes.last().unwrap() > VERITY_BLOCK_SIZE {
        let above = padded_digests_size(*level_sizes.last().unwrap());
        level_sizes.push(above);
    }

    // Digest the content into the bottom level, then each level into the
    // one above it.
    let mut levels: Vec<Vec<u8>> = level_sizes.iter().map(|size| vec![0u8; *size]).collect();
    digest_blocks_of_regions(regions, salt, &mut levels[0]);
    for i in 1..levels.len() {
        let (below, above) = levels.split_at_mut(i);
        let source: &[u8] = &below[i - 1];
        digest_blocks_of_regions(&[source], salt, &mut above[0]);
    }

    let top = levels.last().unwrap();
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(top);
    let root_hash: [u8; DIGEST_LEN] = hasher.finalize().into();

    // Serialized layout is top level first, leaves last.
    let mut tree = Vec::with_capacity(level_sizes.iter().sum());
    for level in levels.iter().rev() {
        tree.extend_from_slice(level);
    }

    VerityTree { root_hash, tree }
}

fn padded_digests_size(data_len: usize) -> usize {
    let blocks = data_len.div_ceil(VERITY_BLOCK_SIZE).max(1);
    (blocks * DIGEST_LEN).div_ceil(VERITY_BLOCK_SIZE) * VERITY_BLOCK_SIZE
}

/// Digests every 4096-byte block of the concatenated regions (final block
/// zero-padded) into `out`, which is already zero-filled to its padded
/// size.
fn digest_blocks_of_regions(regions: &[&[u8]], salt: &[u8], out: &mut [u8]) {
    let mut block = [0u8; VERITY_BLOCK_SIZE];
    let mut reader = RegionReader { regions, region: 0, offset: 0 };
    let mut written = 0;
    loop {
        let filled = reader.fill(&mut block);
        if filled == 0 {
            break;
        }
        block[filled..].fill(0);
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(block);
        out[written..written + DIGEST_LEN].copy_from_slice(&hasher.finalize());
        written += DIGEST_LEN;
    }
}

/// Cursor over a list of regions treated as one contiguous stream.
struct RegionReader<'a> {
    regions: &'a [&'a [u8]],
    region: usize,
    offset: usize
}

impl RegionReader<'_> {
    fn fill(&mut self, buf: &mut [u8]) -> usize {
        let mut filled = 0;
        while filled < buf.len() && self.region < self.regions.len() {
            let current = self.regions[self.region];
            if self.offset >= current.len() {
                self.region += 1;
                self.offset = 0;
                continue;
            }
            let take = (current.len() - self.offset).min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&current[self.offset..self.offset + take]);
            filled += take;
            self.offset += take;
        }
        filled
    }
}
