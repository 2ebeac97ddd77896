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

//! The fixed algorithm tables shared by every signature scheme: content
//! digest kinds, signature algorithm IDs, and the per-scheme suggestion
//! logic that picks algorithms for a given key and minimum platform
//! version.

use reseal_common::*;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;

/// Android SDK versions the schemes care about.
pub mod sdk {
    /// First release that accepts SHA-256 based JAR signatures.
    pub const JELLY_BEAN_MR2: u32 = 18;
    /// First release with APK Signature Scheme v2.
    pub const N: u32 = 24;
    /// First release with APK Signature Scheme v3.
    pub const P: u32 = 28;
    /// First release with APK Signature Scheme v3.1.
    pub const T: u32 = 33;
    /// Android reads maxSdkVersion as a signed 32-bit value, so "forever"
    /// stops at 0x7FFFFFFF rather than u32::MAX.
    pub const MAX: u32 = 0x7FFF_FFFF;
}

/// Scheme version identifiers as used in stamp digest maps and the
/// `X-Android-APK-Signed` v1 attribute.
pub const VERSION_SOURCE_STAMP: u32 = 0;
pub const VERSION_JAR_SIGNATURE_SCHEME: u32 = 1;
pub const VERSION_APK_SIGNATURE_SCHEME_V2: u32 = 2;
pub const VERSION_APK_SIGNATURE_SCHEME_V3: u32 = 3;
pub const VERSION_APK_SIGNATURE_SCHEME_V31: u32 = 31;

/// How the archive contents get digested before signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentDigestAlgorithm {
    /// SHA-256 over 1 MiB chunks, combined at a second level.
    ChunkedSha256,
    /// SHA-512 over 1 MiB chunks, combined at a second level.
    ChunkedSha512,
    /// SHA-256 Merkle tree over 4096-byte blocks (fs-verity layout).
    VerityChunkedSha256,
    /// Plain single-shot SHA-256. Only used for the v1 manifest digest
    /// inside the source stamp block.
    Sha256
}

impl ContentDigestAlgorithm {
    /// Platform-assigned identifier, used in stamp digest records.
    pub fn id(&self) -> u32 {
        match self {
            ContentDigestAlgorithm::ChunkedSha256 => 1,
            ContentDigestAlgorithm::ChunkedSha512 => 2,
            ContentDigestAlgorithm::VerityChunkedSha256 => 3,
            ContentDigestAlgorithm::Sha256 => 4
        }
    }

    /// Size in bytes of the digest this algorithm produces. The verity
    /// digest carries the total content length after the root hash.
    pub fn digest_len(&self) -> usize {
        match self {
            ContentDigestAlgorithm::ChunkedSha256 => 32,
            ContentDigestAlgorithm::ChunkedSha512 => 64,
            ContentDigestAlgorithm::VerityChunkedSha256 => 32 + 8,
            ContentDigestAlgorithm::Sha256 => 32
        }
    }

    /// Strength order used when one digest must be chosen out of several,
    /// higher is stronger: VERITY_CHUNKED_SHA256 > CHUNKED_SHA512 >
    /// CHUNKED_SHA256. Unrankable kinds sort below everything.
    pub fn strength_order(&self) -> i32 {
        match self {
            ContentDigestAlgorithm::ChunkedSha256 => 0,
            ContentDigestAlgorithm::ChunkedSha512 => 1,
            ContentDigestAlgorithm::VerityChunkedSha256 => 2,
            ContentDigestAlgorithm::Sha256 => -1
        }
    }
}

/// A (cipher, digest) pairing with the platform version that introduced
/// it. The IDs are wire constants shared with on-device verifiers and must
/// never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignatureAlgorithm {
    RsaPssWithSha256,
    RsaPssWithSha512,
    RsaPkcs1V15WithSha256,
    RsaPkcs1V15WithSha512,
    EcdsaWithSha256,
    EcdsaWithSha512,
    DsaWithSha256,
    VerityRsaPkcs1V15WithSha256,
    VerityEcdsaWithSha256,
    VerityDsaWithSha256
}

impl SignatureAlgorithm {
    pub fn id(&self) -> u32 {
        match self {
            SignatureAlgorithm::RsaPssWithSha256 => 0x0101,
            SignatureAlgorithm::RsaPssWithSha512 => 0x0102,
            SignatureAlgorithm::RsaPkcs1V15WithSha256 => 0x0103,
            SignatureAlgorithm::RsaPkcs1V15WithSha512 => 0x0104,
            SignatureAlgorithm::EcdsaWithSha256 => 0x0201,
            SignatureAlgorithm::EcdsaWithSha512 => 0x0202,
            SignatureAlgorithm::DsaWithSha256 => 0x0301,
            SignatureAlgorithm::VerityRsaPkcs1V15WithSha256 => 0x0421,
            SignatureAlgorithm::VerityEcdsaWithSha256 => 0x0423,
            SignatureAlgorithm::VerityDsaWithSha256 => 0x0425
        }
    }

    pub fn from_id(id: u32) -> Option<SignatureAlgorithm> {
        Some(match id {
            0x0101 => SignatureAlgorithm::RsaPssWithSha256,
            0x0102 => SignatureAlgorithm::RsaPssWithSha512,
            0x0103 => SignatureAlgorithm::RsaPkcs1V15WithSha256,
            0x0104 => SignatureAlgorithm::RsaPkcs1V15WithSha512,
            0x0201 => SignatureAlgorithm::EcdsaWithSha256,
            0x0202 => SignatureAlgorithm::EcdsaWithSha512,
            0x0301 => SignatureAlgorithm::DsaWithSha256,
            0x0421 => SignatureAlgorithm::VerityRsaPkcs1V15WithSha256,
            0x0423 => SignatureAlgorithm::VerityEcdsaWithSha256,
            0x0425 => SignatureAlgorithm::VerityDsaWithSha256,
            _ => return None
        })
    }

    pub fn content_digest_algorithm(&self) -> ContentDigestAlgorithm {
        match self {
            SignatureAlgorithm::RsaPssWithSha256
            | SignatureAlgorithm::RsaPkcs1V15WithSha256
            | SignatureAlgorithm::EcdsaWithSha256
            | SignatureAlgorithm::DsaWithSha256 => ContentDigestAlgorithm::ChunkedSha256,
            SignatureAlgorithm::RsaPssWithSha512
            | SignatureAlgorithm::RsaPkcs1V15WithSha512
            | SignatureAlgorithm::EcdsaWithSha512 => ContentDigestAlgorithm::ChunkedSha512,
            SignatureAlgorithm::VerityRsaPkcs1V15WithSha256
            | SignatureAlgorithm::VerityEcdsaWithSha256
            | SignatureAlgorithm::VerityDsaWithSha256 => {
                ContentDigestAlgorithm::VerityChunkedSha256
            }
        }
    }

    /// First platform release able to verify this algorithm.
    pub fn min_sdk_version(&self) -> u32 {
        match self {
            SignatureAlgorithm::VerityRsaPkcs1V15WithSha256
            | SignatureAlgorithm::VerityEcdsaWithSha256
            | SignatureAlgorithm::VerityDsaWithSha256 => sdk::P,
            _ => sdk::N
        }
    }
}

/// RSA keys of at most this many bits sign with SHA-256; longer keys move
/// up to SHA-512 for comparable strength.
const RSA_SHA256_MAX_MODULUS_BITS: usize = 3072;

/// Proposes the signature algorithms a v2 signer should produce for the
/// given RSA key, strongest compatibility first.
pub fn suggested_v2_algorithms(
    public_key: &RsaPublicKey,
    _min_sdk_version: u32,
    verity_enabled: bool
) -> Vec<SignatureAlgorithm> {
    let modulus_bits = public_key.n().bits();
    if modulus_bits <= RSA_SHA256_MAX_MODULUS_BITS {
        let mut algorithms = vec![SignatureAlgorithm::RsaPkcs1V15WithSha256];
        if verity_enabled {
            algorithms.push(SignatureAlgorithm::VerityRsaPkcs1V15WithSha256);
        }
        algorithms
    } else {
        // Keys longer than 3072 bits deserve a digest of matching strength
        vec![SignatureAlgorithm::RsaPkcs1V15WithSha512]
    }
}

/// v3 proposes the same algorithm set as v2 for RSA keys.
pub fn suggested_v3_algorithms(
    public_key: &RsaPublicKey,
    min_sdk_version: u32,
    verity_enabled: bool
) -> Vec<SignatureAlgorithm> {
    suggested_v2_algorithms(public_key, min_sdk_version, verity_enabled)
}

/// v4 reuses the v3 proposal but only keeps algorithms whose content
/// digest it can bind to (the chunked kinds; the verity digest is what v4
/// itself recomputes).
pub fn suggested_v4_algorithms(
    public_key: &RsaPublicKey,
    min_sdk_version: u32
) -> Result<Vec<SignatureAlgorithm>> {
    let algorithms: Vec<SignatureAlgorithm> =
        suggested_v3_algorithms(public_key, min_sdk_version, false)
            .into_iter()
            .filter(|a| {
                matches!(
                    a.content_digest_algorithm(),
                    ContentDigestAlgorithm::ChunkedSha256 | ContentDigestAlgorithm::ChunkedSha512
                )
            })
            .collect();
    if algorithms.is_empty() {
        return Err(ResealError::KeyAlgorithmUnsupported(
            "no signature algorithm with a v4-compatible content digest".into()
        ));
    }
    Ok(algorithms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verity_outranks_the_chunked_digests() {
        let mut all = [
            ContentDigestAlgorithm::ChunkedSha256,
            ContentDigestAlgorithm::VerityChunkedSha256,
            ContentDigestAlgorithm::ChunkedSha512
        ];
        all.sort_by_key(|a| a.strength_order());
        assert_eq!(
            all,
            [
                ContentDigestAlgorithm::ChunkedSha256,
                ContentDigestAlgorithm::ChunkedSha512,
                ContentDigestAlgorithm::VerityChunkedSha256
            ]
        );
    }

    #[test]
    fn ids_round_trip() {
        for alg in [
            SignatureAlgorithm::RsaPssWithSha256,
            SignatureAlgorithm::RsaPkcs1V15WithSha256,
            SignatureAlgorithm::RsaPkcs1V15WithSha512,
            SignatureAlgorithm::VerityRsaPkcs1V15WithSha256,
            SignatureAlgorithm::DsaWithSha256
        ] {
            assert_eq!(SignatureAlgorithm::from_id(alg.id()), Some(alg));
        }
        assert_eq!(SignatureAlgorithm::from_id(0xdead), None);
    }
}
