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

//! APK Signature Scheme v4: a side file (`.idsig`) pairing an fs-verity
//! Merkle root over the signed archive with a signature that binds the
//! root to the strongest content digest already present in the archive's
//! v2/v3 blocks.

use std::io::Write;

use reseal_common::*;

use crate::algorithms::SignatureAlgorithm;
use crate::crypto::generate_signatures_over_data;
use crate::crypto_keys::SchemeSignerConfig;
use crate::signing_block::{
    find_signing_block_pairs, parse_scheme_block_signers, SIGNATURE_SCHEME_V2_BLOCK_ID,
    SIGNATURE_SCHEME_V31_BLOCK_ID, SIGNATURE_SCHEME_V3_BLOCK_ID
};
use crate::verity::build_verity_tree;
use crate::zip_parser::find_offsets;
use crate::algorithms::ContentDigestAlgorithm;

pub const V4_FORMAT_VERSION: u32 = 2;
pub const HASHING_ALGORITHM_SHA256: u32 = 1;
pub const LOG2_BLOCK_SIZE_4096_BYTES: u8 = 12;

/// The two signer identities a v4 signature can carry: the v3.0-aligned
/// signer and, when rotation produced a v3.1 block, the rotated signer
/// nested under the v3.1 block id.
pub struct V4SignerConfig {
    pub v4: SchemeSignerConfig,
    pub v41: Option<SchemeSignerConfig>
}

pub struct HashingInfo {
    pub hash_algorithm: u32,
    pub log2_blocksize: u8,
    /// Always empty: fs-verity on-device verification expects no salt.
    pub salt: Vec<u8>,
    pub raw_root_hash: Vec<u8>
}

impl HashingInfo {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(&self.hash_algorithm.to_le_bytes());
        out.push(self.log2_blocksize);
        write_sized(&mut out, &self.salt);
        write_sized(&mut out, &self.raw_root_hash);
        out
    }
}

pub struct SigningInfo {
    pub apk_digest: Vec<u8>,
    pub certificate: Vec<u8>,
    pub additional_data: Vec<u8>,
    pub public_key: Vec<u8>,
    pub signature_algorithm_id: u32,
    pub signature: Vec<u8>
}

impl SigningInfo {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        write_sized(&mut out, &self.apk_digest);
        write_sized(&mut out, &self.certificate);
        write_sized(&mut out, &self.additional_data);
        write_sized(&mut out, &self.public_key);
        out.extend_from_slice(&self.signature_algorithm_id.to_le_bytes());
        write_sized(&mut out, &self.signature);
        out
    }
}

/// The serialized side file: `version ‖ sized(hashing info) ‖
/// sized(signing infos)`; the verity tree follows separately.
pub struct V4Signature {
    pub version: u32,
    pub hashing_info: Vec<u8>,
    pub signing_infos: Vec<u8>
}

impl V4Signature {
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(&self.version.to_le_bytes())?;
        out.write_all(&(self.hashing_info.len() as u32).to_le_bytes())?;
        out.write_all(&self.hashing_info)?;
        out.write_all(&(self.signing_infos.len() as u32).to_le_bytes())?;
        out.write_all(&self.signing_infos)?;
        Ok(())
    }

    /// Appends the length-prefixed verity tree, the optional trailer a
    /// verifier needs at install-commit time.
    pub fn write_tree<W: Write>(out: &mut W, tree: &[u8]) -> Result<()> {
        out.write_all(&(tree.len() as u32).to_le_bytes())?;
        out.write_all(tree)?;
        Ok(())
    }
}

fn write_sized(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Computes the Merkle tree over the signed archive and signs the binding
/// structure. Returns the signature file contents and the tree bytes.
pub fn generate_v4_signature(
    apk: &[u8],
    config: &V4SignerConfig
) -> Result<(V4Signature, Vec<u8>)> {
    let apk_digest = get_apk_digest(apk)?;

    // Salt has to stay empty for fs-verity compatibility
    let tree = build_verity_tree(&[apk], &[]);
    let hashing_info = HashingInfo {
        hash_algorithm: HASHING_ALGORITHM_SHA256,
        log2_blocksize: LOG2_BLOCK_SIZE_4096_BYTES,
        salt: vec![],
        raw_root_hash: tree.root_hash.to_vec()
    };

    let signing_info =
        generate_signing_info(&config.v4, &hashing_info, &apk_digest, apk.len() as u64)?;
    let mut signing_infos = signing_info.to_bytes();
    if let Some(v41) = &config.v41 {
        let nested = generate_signing_info(v41, &hashing_info, &apk_digest, apk.len() as u64)?;
        signing_infos.extend_from_slice(&SIGNATURE_SCHEME_V31_BLOCK_ID.to_le_bytes());
        write_sized(&mut signing_infos, &nested.to_bytes());
    }

    let signature = V4Signature {
        version: V4_FORMAT_VERSION,
        hashing_info: hashing_info.to_bytes(),
        signing_infos
    };
    Ok((signature, tree.tree))
}

fn generate_signing_info(
    config: &SchemeSignerConfig,
    hashing_info: &HashingInfo,
    apk_digest: &[u8],
    file_size: u64
) -> Result<SigningInfo> {
    if config.certificates.len() != 1 {
        return Err(ResealError::KeyAlgorithmUnsupported(
            "v4 signing requires exactly one certificate".into()
        ));
    }
    let mut unsigned = SigningInfo {
        apk_digest: apk_digest.to_vec(),
        certificate: config.signing_certificate().to_vec(),
        additional_data: vec![],
        public_key: config.pub_key_as_der()?,
        signature_algorithm_id: 0,
        signature: vec![]
    };

    let signed_data = get_signed_data(file_size, hashing_info, &unsigned);
    let mut signatures = generate_signatures_over_data(config, &signed_data)?;
    if signatures.len() != 1 {
        return Err(ResealError::KeyAlgorithmUnsupported(
            "v4 signing must produce exactly one signature".into()
        ));
    }
    let (algorithm_id, signature) = signatures.remove(0);
    unsigned.signature_algorithm_id = algorithm_id;
    unsigned.signature = signature;
    Ok(unsigned)
}

/// The structure the v4 signature actually covers: file size, hashing
/// parameters, and the identity fields of the signing info.
fn get_signed_data(file_size: u64, hashing_info: &HashingInfo, info: &SigningInfo) -> Vec<u8> {
    let size = 4
        + 8
        + 4
        + 1
        + 4
        + hashing_info.salt.len()
        + 4
        + hashing_info.raw_root_hash.len()
        + 4
        + info.apk_digest.len()
        + 4
        + info.certificate.len()
        + 4
        + info.additional_data.len();
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(size as u32).to_le_bytes());
    out.extend_from_slice(&file_size.to_le_bytes());
    out.extend_from_slice(&hashing_info.hash_algorithm.to_le_bytes());
    out.push(hashing_info.log2_blocksize);
    write_sized(&mut out, &hashing_info.salt);
    write_sized(&mut out, &hashing_info.raw_root_hash);
    write_sized(&mut out, &info.apk_digest);
    write_sized(&mut out, &info.certificate);
    write_sized(&mut out, &info.additional_data);
    out
}

/// Extracts the strongest already-computed content digest from the signed
/// archive, preferring the v3 block over v2.
pub fn get_apk_digest(apk: &[u8]) -> Result<Vec<u8>> {
    let sections = find_offsets(apk)?;
    let pairs = find_signing_block_pairs(apk, &sections)?;

    let v3_result = best_digest_of_block(&pairs, SIGNATURE_SCHEME_V3_BLOCK_ID, true);
    match v3_result {
        Ok(digest) => Ok(digest),
        Err(v3_error) => best_digest_of_block(&pairs, SIGNATURE_SCHEME_V2_BLOCK_ID, false)
            .map_err(|v2_error| {
                ResealError::MalformedSigningBlock(format!(
                    "failed to obtain a v2/v3 digest; v3: {:?}, v2: {:?}",
                    v3_error, v2_error
                ))
            })
    }
}

fn best_digest_of_block(
    pairs: &[(u32, Vec<u8>)],
    block_id: u32,
    allow_verity: bool
) -> Result<Vec<u8>> {
    let block = pairs
        .iter()
        .find(|(id, _)| *id == block_id)
        .map(|(_, value)| value)
        .ok_or_else(|| {
            ResealError::MalformedSigningBlock(format!("no block with id 0x{block_id:08x}"))
        })?;
    let signers = parse_scheme_block_signers(block)?;
    if signers.len() != 1 {
        return Err(ResealError::MalformedSigningBlock(format!(
            "expected one signer in block 0x{block_id:08x}, found {}",
            signers.len()
        )));
    }
    pick_best_digest(&signers[0].digests, allow_verity)
}

/// Chooses the strongest digest out of a signer's digest records:
/// VERITY_CHUNKED_SHA256 > CHUNKED_SHA512 > CHUNKED_SHA256. The verity
/// digest only counts where the enclosing scheme can carry it (v3).
pub fn pick_best_digest(digests: &[(u32, Vec<u8>)], allow_verity: bool) -> Result<Vec<u8>> {
    let mut best_order = -1;
    let mut best: Option<&[u8]> = None;
    for (algorithm_id, digest) in digests {
        let Some(algorithm) = SignatureAlgorithm::from_id(*algorithm_id) else {
            continue;
        };
        let content_digest = algorithm.content_digest_algorithm();
        if content_digest == ContentDigestAlgorithm::VerityChunkedSha256 && !allow_verity {
            continue;
        }
        let order = content_digest.strength_order();
        if order > best_order {
            best_order = order;
            best = Some(digest);
        }
    }
    best.map(|d| d.to_vec()).ok_or_else(|| {
        ResealError::MalformedSigningBlock(
            "no supported content digest found in the source archive".into()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::SignatureAlgorithm;

    #[test]
    fn best_digest_prefers_verity_then_sha512_then_sha256() {
        let digests = vec![
            (SignatureAlgorithm::RsaPkcs1V15WithSha256.id(), vec![1u8; 32]),
            (SignatureAlgorithm::VerityRsaPkcs1V15WithSha256.id(), vec![3u8; 40]),
            (SignatureAlgorithm::RsaPkcs1V15WithSha512.id(), vec![2u8; 64]),
        ];
        assert_eq!(pick_best_digest(&digests, true).unwrap(), vec![3u8; 40]);
        assert_eq!(pick_best_digest(&digests, false).unwrap(), vec![2u8; 64]);
        let sha256_only = &digests[..1];
        assert_eq!(pick_best_digest(sha256_only, true).unwrap(), vec![1u8; 32]);
    }
}
