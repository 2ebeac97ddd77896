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

//! Assembly and parsing of the APK Signing Block container: the
//! `(length ‖ id ‖ value)` pair sequence with its size-twice-plus-magic
//! footer, the page-alignment padding rules, and enough parsing to pull
//! individual scheme blocks (and their signers' certificates and digests)
//! back out of an existing archive.

use deku::DekuContainerWrite;
use reseal_common::*;

use crate::signing_types::{
    len_pfx_u64, ApkSigningBlock, SigningBlockIdValuePair, SigningBlockPairs
};
use crate::zip_parser::ZipSections;

pub const SIGNATURE_SCHEME_V2_BLOCK_ID: u32 = 0x7109871A;
pub const SIGNATURE_SCHEME_V3_BLOCK_ID: u32 = 0xF05368C0;
pub const SIGNATURE_SCHEME_V31_BLOCK_ID: u32 = 0x1B93AD61;
pub const VERITY_PADDING_BLOCK_ID: u32 = 0x42726577;
pub const V1_SOURCE_STAMP_BLOCK_ID: u32 = 0x2B09189E;
pub const V2_SOURCE_STAMP_BLOCK_ID: u32 = 0x6DFF800D;
pub const APK_SIGNING_BLOCK_MAGIC: &[u8; 16] = b"APK Sig Block 42";
pub const ANDROID_COMMON_PAGE_ALIGNMENT: usize = 4096;

/// Block IDs never carried over when preserving an existing container:
/// padding is recomputed, and appending new scheme blocks invalidates any
/// previous source stamp.
pub const DISCARDED_SIGNATURE_BLOCK_IDS: [u32; 3] = [
    VERITY_PADDING_BLOCK_ID,
    V1_SOURCE_STAMP_BLOCK_ID,
    V2_SOURCE_STAMP_BLOCK_ID
];

/// Zero bytes to append to the entries region so the signing block starts
/// on a page boundary.
pub fn entries_padding(entries_len: usize) -> usize {
    let overflow = entries_len % ANDROID_COMMON_PAGE_ALIGNMENT;
    if overflow == 0 {
        0
    } else {
        ANDROID_COMMON_PAGE_ALIGNMENT - overflow
    }
}

/// Concatenates the scheme blocks into one serialized APK Signing Block.
///
/// With `page_align` set, a padding pair with [VERITY_PADDING_BLOCK_ID] is
/// inserted before the footer so the container's total size is a multiple
/// of 4096; combined with [entries_padding] this keeps everything before
/// the central directory page-aligned.
pub fn generate_apk_signing_block(
    scheme_blocks: &[(u32, Vec<u8>)],
    page_align: bool
) -> Result<Vec<u8>> {
    let mut pairs: Vec<_> = scheme_blocks
        .iter()
        .map(|(id, value)| {
            len_pfx_u64(SigningBlockIdValuePair {
                id: *id,
                value: value.clone()
            })
        })
        .collect();

    // length field (8) + footer size copy (8) + magic (16), on top of the
    // pair sequence itself
    let pairs_len: usize = pairs.iter().map(|p| 8 + p.length as usize).sum();
    let mut result_size = 8 + pairs_len + 8 + 16;

    if page_align && result_size % ANDROID_COMMON_PAGE_ALIGNMENT != 0 {
        let mut padding = ANDROID_COMMON_PAGE_ALIGNMENT
            - (result_size % ANDROID_COMMON_PAGE_ALIGNMENT);
        // A pair cannot be smaller than its length and id fields
        if padding < 12 {
            padding += ANDROID_COMMON_PAGE_ALIGNMENT;
        }
        pairs.push(len_pfx_u64(SigningBlockIdValuePair {
            id: VERITY_PADDING_BLOCK_ID,
            value: vec![0u8; padding - 12]
        }));
        result_size += padding;
    }

    let sig_block_size = (result_size - 8) as u64;
    let block = ApkSigningBlock {
        size_of_self_not_counted: sig_block_size,
        pairs: SigningBlockPairs { pairs },
        size_of_self_counted: sig_block_size,
        magic: *APK_SIGNING_BLOCK_MAGIC
    };
    Ok(block.to_bytes()?)
}

/// Little-endian cursor over a byte slice; every read is bounds-checked so
/// malformed containers surface as errors instead of panics.
pub struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize
}

impl<'a> SliceReader<'a> {
    pub fn new(buf: &'a [u8]) -> SliceReader<'a> {
        SliceReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ResealError::MalformedSigningBlock(format!(
                "needed {} bytes but only {} remain",
                len,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads a uint32 length then that many bytes.
    pub fn length_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }
}

/// Locates the APK Signing Block in a fully signed archive and returns its
/// `(id, value)` pairs.
pub fn find_signing_block_pairs(
    apk: &[u8],
    sections: &ZipSections
) -> Result<Vec<(u32, Vec<u8>)>> {
    let cd_start = sections.cd_start;
    if cd_start < 32 || apk.len() < cd_start {
        return Err(ResealError::MalformedSigningBlock(
            "no room for a signing block before the central directory".into()
        ));
    }
    let footer = &apk[cd_start - 24..cd_start];
    if &footer[8..24] != APK_SIGNING_BLOCK_MAGIC {
        return Err(ResealError::MalformedSigningBlock(
            "signing block magic not found before the central directory".into()
        ));
    }
    let size = u64::from_le_bytes(footer[..8].try_into().unwrap()) as usize;
    // size excludes the leading size field
    if size < 24 || size + 8 > cd_start {
        return Err(ResealError::MalformedSigningBlock(format!(
            "implausible signing block size {size}"
        )));
    }
    let block_start = cd_start - size - 8;
    let leading_size =
        u64::from_le_bytes(apk[block_start..block_start + 8].try_into().unwrap()) as usize;
    if leading_size != size {
        return Err(ResealError::MalformedSigningBlock(format!(
            "size fields disagree: {leading_size} vs {size}"
        )));
    }
    parse_signing_block_pairs(&apk[block_start..cd_start])
}

/// Splits a serialized container (including both size fields and magic)
/// into its `(id, value)` pairs.
pub fn parse_signing_block_pairs(block: &[u8]) -> Result<Vec<(u32, Vec<u8>)>> {
    if block.len() < 32 {
        return Err(ResealError::MalformedSigningBlock(
            "container shorter than its fixed overhead".into()
        ));
    }
    let mut reader = SliceReader::new(&block[8..block.len() - 24]);
    let mut pairs = vec![];
    while reader.remaining() > 0 {
        let pair_len = reader.read_u64()? as usize;
        if pair_len < 4 {
            return Err(ResealError::MalformedSigningBlock(format!(
                "pair length {pair_len} cannot hold an id"
            )));
        }
        let mut pair = SliceReader::new(reader.take(pair_len)?);
        let id = pair.read_u32()?;
        pairs.push((id, pair.take(pair_len - 4)?.to_vec()));
    }
    Ok(pairs)
}

/// A signer parsed out of a v2/v3 scheme block, with just the parts the
/// engine needs: the raw signer bytes (for preservation), the certificate
/// chain, and the digest records.
pub struct ParsedSigner {
    pub raw: Vec<u8>,
    pub certificates: Vec<Vec<u8>>,
    /// `(signature algorithm id, digest)` records in block order.
    pub digests: Vec<(u32, Vec<u8>)>
}

/// Parses the signers of a v2 or v3 scheme block. The v3 per-signer
/// min/max SDK fields sit after the signed data, so the shared prefix
/// (signed data → digests, certificates) parses identically for both.
pub fn parse_scheme_block_signers(block: &[u8]) -> Result<Vec<ParsedSigner>> {
    let mut reader = SliceReader::new(block);
    let mut signers_seq = SliceReader::new(reader.length_prefixed()?);
    let mut signers = vec![];
    while signers_seq.remaining() > 0 {
        let raw = signers_seq.length_prefixed()?;
        let mut signer = SliceReader::new(raw);
        let mut signed_data = SliceReader::new(signer.length_prefixed()?);

        let mut digests = vec![];
        let mut digests_seq = SliceReader::new(signed_data.length_prefixed()?);
        while digests_seq.remaining() > 0 {
            let mut record = SliceReader::new(digests_seq.length_prefixed()?);
            let algorithm_id = record.read_u32()?;
            digests.push((algorithm_id, record.length_prefixed()?.to_vec()));
        }

        let mut certificates = vec![];
        let mut certs_seq = SliceReader::new(signed_data.length_prefixed()?);
        while certs_seq.remaining() > 0 {
            certificates.push(certs_seq.length_prefixed()?.to_vec());
        }

        signers.push(ParsedSigner {
            raw: raw.to_vec(),
            certificates,
            digests
        });
    }
    Ok(signers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_round_trips_through_the_parser() {
        let blocks = vec![(0x1111u32, vec![1u8; 10]), (0x2222u32, vec![2u8; 99])];
        let container = generate_apk_signing_block(&blocks, false).unwrap();
        let pairs = parse_signing_block_pairs(&container).unwrap();
        assert_eq!(pairs, blocks);
    }

    #[test]
    fn page_aligned_container_gets_exactly_one_padding_pair() {
        let blocks = vec![(SIGNATURE_SCHEME_V2_BLOCK_ID, vec![0u8; 1000])];
        let container = generate_apk_signing_block(&blocks, true).unwrap();
        assert_eq!(container.len() % ANDROID_COMMON_PAGE_ALIGNMENT, 0);
        let pairs = parse_signing_block_pairs(&container).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].0, VERITY_PADDING_BLOCK_ID);
        assert!(pairs[1].1.iter().all(|b| *b == 0));
    }

    #[test]
    fn entries_padding_is_deterministic() {
        assert_eq!(entries_padding(0), 0);
        assert_eq!(entries_padding(4096), 0);
        assert_eq!(entries_padding(8192), 0);
        for size in [1usize, 100, 4095, 4097, 12_345] {
            let padding = entries_padding(size);
            assert_eq!((size + padding) % ANDROID_COMMON_PAGE_ALIGNMENT, 0);
            assert!(padding < ANDROID_COMMON_PAGE_ALIGNMENT);
            assert_eq!(
                padding,
                (ANDROID_COMMON_PAGE_ALIGNMENT - size % ANDROID_COMMON_PAGE_ALIGNMENT)
                    % ANDROID_COMMON_PAGE_ALIGNMENT
            );
        }
    }

    #[test]
    fn already_aligned_container_gains_no_padding_pair() {
        // 8 (pair len) + 4 (id) + value + 8 + 8 + 16 = 4096
        let value_len = ANDROID_COMMON_PAGE_ALIGNMENT - 44;
        let blocks = vec![(SIGNATURE_SCHEME_V2_BLOCK_ID, vec![7u8; value_len])];
        let container = generate_apk_signing_block(&blocks, true).unwrap();
        assert_eq!(container.len() % ANDROID_COMMON_PAGE_ALIGNMENT, 0);
        let pairs = parse_signing_block_pairs(&container).unwrap();
        assert_eq!(pairs.len(), 1);
    }
}
