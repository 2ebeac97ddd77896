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

//! Chunked content digests over the three zip regions (entries, central
//! directory, end-of-central-directory).
//!
//! Each region is split into 1 MiB chunks; chunks never span a region
//! boundary, which is what makes them independently computable. Every
//! chunk digest is prefixed with `0xa5` and the chunk length, the combined
//! digest with `0x5a` and the chunk count.

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use reseal_common::*;
use sha2::{Digest, Sha256, Sha512};

use crate::algorithms::ContentDigestAlgorithm;
use crate::verity;

pub const BYTES_IN_1MB: usize = 1024 * 1024;
pub const FIRST_LEVEL_CHUNK_MAGIC: u8 = 0xa5;
pub const SECOND_LEVEL_CHUNK_MAGIC: u8 = 0x5a;

/// Runs the per-chunk digest work. The chunk digests are independent, so a
/// caller that signs large archives can opt into worker threads; the
/// single-threaded variant is the safe fallback and also what the tests
/// use for reproducible orderings (the output is order-preserving either
/// way).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executor {
    SingleThreaded,
    /// One worker per available core, scoped to the call.
    MultiThreaded
}

impl Executor {
    /// Applies `f` to every chunk, returning results in chunk order.
    pub fn map_chunks<F>(&self, chunks: &[&[u8]], f: F) -> Vec<Vec<u8>>
    where
        F: Fn(&[u8]) -> Vec<u8> + Sync
    {
        match self {
            Executor::SingleThreaded => chunks.iter().map(|c| f(c)).collect(),
            Executor::MultiThreaded => {
                let workers = thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
                    .min(chunks.len().max(1));
                let stripe_len = chunks.len().div_ceil(workers.max(1)).max(1);
                let f = &f;
                thread::scope(|scope| {
                    let handles: Vec<_> = chunks
                        .chunks(stripe_len)
                        .map(|stripe| scope.spawn(move || stripe.iter().map(|c| f(c)).collect::<Vec<_>>()))
                        .collect();
                    handles
                        .into_iter()
                        .flat_map(|handle| handle.join().expect("digest worker panicked"))
                        .collect()
                })
            }
        }
    }
}

/// Splits every region into 1 MiB chunks, respecting region boundaries.
pub fn chunk_regions<'a>(regions: &[&'a [u8]]) -> Vec<&'a [u8]> {
    let mut chunks = vec![];
    for region in regions {
        let mut pos = 0;
        while pos < region.len() {
            let end = (pos + BYTES_IN_1MB).min(region.len());
            chunks.push(&region[pos..end]);
            pos = end;
        }
    }
    chunks
}

/// Computes the requested content digests over `entries ‖ cd ‖ eocd` in a
/// single pass over the chunk list per algorithm.
pub fn compute_content_digests(
    algorithms: &BTreeSet<ContentDigestAlgorithm>,
    regions: &[&[u8]; 3],
    executor: Executor
) -> Result<BTreeMap<ContentDigestAlgorithm, Vec<u8>>> {
    let chunks = chunk_regions(regions);
    let mut digests = BTreeMap::new();

    for algorithm in algorithms {
        let digest = match algorithm {
            ContentDigestAlgorithm::ChunkedSha256 => {
                chunked_digest::<Sha256>(&chunks, executor)
            }
            ContentDigestAlgorithm::ChunkedSha512 => {
                chunked_digest::<Sha512>(&chunks, executor)
            }
            ContentDigestAlgorithm::VerityChunkedSha256 => {
                verity::verity_content_digest(regions)
            }
            ContentDigestAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                for region in regions {
                    hasher.update(region);
                }
                hasher.finalize().to_vec()
            }
        };
        digests.insert(*algorithm, digest);
    }

    Ok(digests)
}

fn chunked_digest<D: Digest + Clone>(chunks: &[&[u8]], executor: Executor) -> Vec<u8> {
    let chunk_digests = executor.map_chunks(chunks, |chunk| {
        let mut hasher = D::new();
        hasher.update([FIRST_LEVEL_CHUNK_MAGIC]);
        hasher.update((chunk.len() as u32).to_le_bytes());
        hasher.update(chunk);
        hasher.finalize().to_vec()
    });

    let mut hasher = D::new();
    hasher.update([SECOND_LEVEL_CHUNK_MAGIC]);
    hasher.update((chunk_digests.len() as u32).to_le_bytes());
    for digest in &chunk_digests {
        hasher.update(digest);
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_never_span_regions() {
        let a = vec![1u8; BYTES_IN_1MB + 1];
        let b = vec![2u8; 10];
        let chunks = chunk_regions(&[&a, &b]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), BYTES_IN_1MB);
        assert_eq!(chunks[1].len(), 1);
        assert_eq!(chunks[2].len(), 10);
    }

    #[test]
    fn executors_agree() {
        let data = vec![7u8; 3 * BYTES_IN_1MB + 123];
        let regions: [&[u8]; 3] = [&data, &[1, 2, 3], &[4, 5]];
        let algorithms: BTreeSet<_> = [
            ContentDigestAlgorithm::ChunkedSha256,
            ContentDigestAlgorithm::ChunkedSha512
        ]
        .into();
        let single =
            compute_content_digests(&algorithms, &regions, Executor::SingleThreaded).unwrap();
        let multi =
            compute_content_digests(&algorithms, &regions, Executor::MultiThreaded).unwrap();
        assert_eq!(single, multi);
    }
}
