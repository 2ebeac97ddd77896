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

//! Source stamp: one more block in the signing container that commits to
//! the digests of every other active scheme under a dedicated stamp key,
//! for provenance tracking.
//!
//! Unlike the primary schemes, a *verifier* treats a structurally broken
//! stamp as a warning rather than a hard failure: a stamp proves
//! provenance when present, but a damaged one must not brick an otherwise
//! valid archive.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use deku::DekuContainerWrite;
use reseal_common::*;
use sha2::{Digest as _, Sha256};

use crate::algorithms::{ContentDigestAlgorithm, SignatureAlgorithm};
use crate::crypto::{generate_signatures_over_data, verify_data};
use crate::crypto_keys::SchemeSignerConfig;
use crate::signing_block::{SliceReader, V2_SOURCE_STAMP_BLOCK_ID};
use crate::signing_types::{
    encode_attribute, len_pfx_u32, Digest, Signature, SignedData, Signer
};

/// Attribute recording when the stamp was produced, in seconds since the
/// epoch.
pub const STAMP_TIME_ATTR_ID: u32 = 0xE43C_5946;

/// Name of the zip entry whose content is the SHA-256 of the stamp
/// certificate; the v1 manifest digests it like any other entry.
pub const SOURCE_STAMP_CERTIFICATE_HASH_ZIP_ENTRY_NAME: &str = "stamp-cert-sha256";

/// Per-scheme content digests: scheme version id -> digest algorithm ->
/// digest bytes.
pub type SchemeDigestInfos = BTreeMap<u32, BTreeMap<ContentDigestAlgorithm, Vec<u8>>>;

/// Builds the v2 source stamp block over the collected scheme digests.
pub fn generate_source_stamp_block(
    config: &SchemeSignerConfig,
    digest_infos: &SchemeDigestInfos
) -> Result<(u32, Vec<u8>)> {
    let mut scheme_records = Vec::with_capacity(digest_infos.len());
    for (scheme_id, digests) in digest_infos {
        // Digest algorithm records sorted by algorithm id; the BTreeMap
        // iterates variants in id order already
        let mut digest_set = Vec::new();
        for (algorithm, digest) in digests {
            digest_set.extend(
                len_pfx_u32(Digest {
                    signature_algorithm_id: algorithm.id(),
                    digest: len_pfx_u32(digest.clone())
                })
                .to_bytes()?
            );
        }
        scheme_records.push(len_pfx_u32(Digest {
            signature_algorithm_id: *scheme_id,
            digest: len_pfx_u32(digest_set)
        }));
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let signed_data = SignedData {
        digests: len_pfx_u32(scheme_records),
        certificates: len_pfx_u32(vec![len_pfx_u32(config.signing_certificate().to_vec())]),
        additional_attributes: len_pfx_u32(encode_attribute(
            STAMP_TIME_ATTR_ID,
            &(timestamp as i64).to_le_bytes()
        ))
    };

    let signed_data_bytes = signed_data.to_bytes()?;
    let signatures = generate_signatures_over_data(config, &signed_data_bytes)?
        .into_iter()
        .map(|(algorithm_id, signature)| {
            len_pfx_u32(Signature {
                signature_algorithm_id: algorithm_id,
                signature: len_pfx_u32(signature)
            })
        })
        .collect();

    // The stamp block has the same layout as a single scheme signer
    let block = Signer {
        signed_data: len_pfx_u32(signed_data),
        signatures: len_pfx_u32(signatures),
        public_key: len_pfx_u32(config.pub_key_as_der()?)
    };
    Ok((V2_SOURCE_STAMP_BLOCK_ID, block.to_bytes()?))
}

/// SHA-256 of the stamp signer's certificate, the content of the
/// `stamp-cert-sha256` zip entry.
pub fn source_stamp_certificate_digest(certificate: &[u8]) -> Vec<u8> {
    Sha256::digest(certificate).to_vec()
}

/// Outcome of a lenient stamp verification: `errors` fail the stamp,
/// `warnings` (malformed structure) do not fail the archive.
#[derive(Debug, Default)]
pub struct StampVerificationResult {
    pub verified: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>
}

/// Verifies a stamp block in isolation against the expected certificate
/// digest and scheme digests. Structural damage downgrades to a warning.
pub fn verify_source_stamp(
    stamp_block: &[u8],
    expected_certificate_digest: &[u8],
    digest_infos: &SchemeDigestInfos,
    public_key: &rsa::RsaPublicKey
) -> StampVerificationResult {
    let mut result = StampVerificationResult::default();
    match parse_stamp_block(stamp_block) {
        Err(_) => {
            result
                .warnings
                .push("malformed source stamp block".to_string());
        }
        Ok(parsed) => {
            let certificate_digest = source_stamp_certificate_digest(&parsed.certificate);
            if certificate_digest != expected_certificate_digest {
                result
                    .errors
                    .push("stamp certificate does not match the expected digest".to_string());
            }

            let mut signature_ok = false;
            for (algorithm_id, signature) in &parsed.signatures {
                let Some(algorithm) = SignatureAlgorithm::from_id(*algorithm_id) else {
                    continue;
                };
                if let Ok(true) =
                    verify_data(public_key, algorithm, &parsed.signed_data, signature)
                {
                    signature_ok = true;
                    break;
                }
            }
            if !signature_ok {
                result.errors.push("no stamp signature verified".to_string());
            }

            for (scheme_id, digests) in digest_infos {
                let Some(recorded) = parsed.scheme_digests.iter().find(|(id, _)| id == scheme_id)
                else {
                    result
                        .errors
                        .push(format!("stamp is missing digests for scheme {scheme_id}"));
                    continue;
                };
                for (algorithm, digest) in digests {
                    let found = recorded
                        .1
                        .iter()
                        .any(|(id, bytes)| *id == algorithm.id() && bytes == digest);
                    if !found {
                        result.errors.push(format!(
                            "stamp digest mismatch for scheme {scheme_id}, algorithm {}",
                            algorithm.id()
                        ));
                    }
                }
            }
            result.verified = result.errors.is_empty();
        }
    }
    result
}

struct ParsedStamp {
    signed_data: Vec<u8>,
    certificate: Vec<u8>,
    /// scheme id -> (digest algorithm id, digest)
    scheme_digests: Vec<(u32, Vec<(u32, Vec<u8>)>)>,
    signatures: Vec<(u32, Vec<u8>)>
}

fn parse_stamp_block(block: &[u8]) -> Result<ParsedStamp> {
    let mut reader = SliceReader::new(block);
    let signed_data_bytes = reader.length_prefixed()?.to_vec();

    let mut signed = SliceReader::new(&signed_data_bytes);
    let mut scheme_digests = vec![];
    let mut digests_seq = SliceReader::new(signed.length_prefixed()?);
    while digests_seq.remaining() > 0 {
        let mut record = SliceReader::new(digests_seq.length_prefixed()?);
        let scheme_id = record.read_u32()?;
        let mut set = vec![];
        let mut set_reader = SliceReader::new(record.length_prefixed()?);
        while set_reader.remaining() > 0 {
            let mut digest_record = SliceReader::new(set_reader.length_prefixed()?);
            let algorithm_id = digest_record.read_u32()?;
            set.push((algorithm_id, digest_record.length_prefixed()?.to_vec()));
        }
        scheme_digests.push((scheme_id, set));
    }
    let mut certs_seq = SliceReader::new(signed.length_prefixed()?);
    let certificate = certs_seq.length_prefixed()?.to_vec();

    let mut signatures = vec![];
    let mut signatures_seq = SliceReader::new(reader.length_prefixed()?);
    while signatures_seq.remaining() > 0 {
        let mut record = SliceReader::new(signatures_seq.length_prefixed()?);
        let algorithm_id = record.read_u32()?;
        signatures.push((algorithm_id, record.length_prefixed()?.to_vec()));
    }

    Ok(ParsedStamp {
        signed_data: signed_data_bytes,
        certificate,
        scheme_digests,
        signatures
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_a_warning_not_an_error() {
        let digest_infos = SchemeDigestInfos::new();
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let key = rsa::RsaPrivateKey::new(&mut rng, 512).unwrap();
        let result = verify_source_stamp(
            &[0u8; 7],
            &[0u8; 32],
            &digest_infos,
            &rsa::RsaPublicKey::from(&key)
        );
        assert!(!result.verified);
        assert!(result.errors.is_empty());
        assert_eq!(result.warnings.len(), 1);
    }
}
