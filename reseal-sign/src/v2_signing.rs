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

//! APK Signature Scheme v2: one block signing the whole-file content
//! digests, with any number of signers.

use std::collections::BTreeMap;

use deku::DekuContainerWrite;
use reseal_common::*;

use crate::algorithms::{ContentDigestAlgorithm, VERSION_APK_SIGNATURE_SCHEME_V3};
use crate::crypto::generate_signatures_over_data;
use crate::crypto_keys::SchemeSignerConfig;
use crate::signing_block::SIGNATURE_SCHEME_V2_BLOCK_ID;
use crate::signing_types::{
    certificate_records, digest_records, encode_attribute, len_pfx_u32, Signature,
    SignatureSchemeBlock, SignedData, Signer
};

/// Attribute advertising that a v3 block is also present, so a verifier
/// rejects an archive whose v3 block has been stripped.
pub const STRIPPING_PROTECTION_ATTR_ID: u32 = 0xBEEF_F00D;

/// Builds the v2 scheme block. `v3_also_signed` adds the stripping
/// protection attribute; `preserved_signers` are raw signer records carried
/// over from the archive's previous signature.
pub fn generate_v2_block(
    content_digests: &BTreeMap<ContentDigestAlgorithm, Vec<u8>>,
    signer_configs: &[SchemeSignerConfig],
    v3_also_signed: bool,
    preserved_signers: &[Vec<u8>]
) -> Result<(u32, Vec<u8>)> {
    let mut signers = Vec::with_capacity(signer_configs.len() + preserved_signers.len());
    for config in signer_configs {
        signers.push(len_pfx_u32(generate_signer(
            config,
            content_digests,
            v3_also_signed
        )?));
    }
    for preserved in preserved_signers {
        signers.push(len_pfx_u32(preserved.clone()));
    }

    let block = SignatureSchemeBlock {
        signers: len_pfx_u32(signers)
    };
    Ok((SIGNATURE_SCHEME_V2_BLOCK_ID, block.to_bytes()?))
}

fn generate_signer(
    config: &SchemeSignerConfig,
    content_digests: &BTreeMap<ContentDigestAlgorithm, Vec<u8>>,
    v3_also_signed: bool
) -> Result<Vec<u8>> {
    let additional_attributes = if v3_also_signed {
        encode_attribute(
            STRIPPING_PROTECTION_ATTR_ID,
            &VERSION_APK_SIGNATURE_SCHEME_V3.to_le_bytes()
        )
    } else {
        vec![]
    };

    let signed_data = SignedData {
        digests: len_pfx_u32(digest_records(&config.algorithms, content_digests)),
        certificates: len_pfx_u32(certificate_records(&config.certificates)),
        additional_attributes: len_pfx_u32(additional_attributes)
    };

    // The signature covers the serialized signed data without its length
    // prefix
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

    let signer = Signer {
        signed_data: len_pfx_u32(signed_data),
        signatures: len_pfx_u32(signatures),
        public_key: len_pfx_u32(config.pub_key_as_der()?)
    };
    Ok(signer.to_bytes()?)
}
