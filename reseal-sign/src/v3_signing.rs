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

//! APK Signature Schemes v3 and v3.1. The layout extends v2 with a
//! per-signer SDK window, and the additional attributes carry the
//! rotation story: the proof-of-rotation lineage, the rotation-min-sdk
//! marker on the v3.0 block, and the dev-release marker on v3.1 signers.

use std::collections::BTreeMap;

use deku::DekuContainerWrite;
use reseal_common::*;

use crate::algorithms::ContentDigestAlgorithm;
use crate::crypto::generate_signatures_over_data;
use crate::crypto_keys::SchemeSignerConfig;
use crate::signing_block::{SIGNATURE_SCHEME_V31_BLOCK_ID, SIGNATURE_SCHEME_V3_BLOCK_ID};
use crate::signing_types::{
    certificate_records, digest_records, encode_attribute, len_pfx_u32, Signature,
    SignatureSchemeBlock, V3SignedData, V3Signer
};

/// Attribute carrying the encoded signing certificate lineage.
pub const PROOF_OF_ROTATION_ATTR_ID: u32 = 0x3BA0_6F8C;
/// Attribute on the v3.0 block naming the SDK version where rotation
/// moves to the v3.1 block.
pub const ROTATION_MIN_SDK_VERSION_ATTR_ID: u32 = 0x559F_8B02;
/// Attribute marking a v3.1 signer as targeting a development release.
pub const ROTATION_ON_DEV_RELEASE_ATTR_ID: u32 = 0xC2A6_B3BA;

pub struct V3BlockParams<'a> {
    /// [SIGNATURE_SCHEME_V3_BLOCK_ID] or [SIGNATURE_SCHEME_V31_BLOCK_ID].
    pub block_id: u32,
    /// Set on the v3.0 block when a v3.1 block accompanies it.
    pub rotation_min_sdk_version: Option<u32>,
    /// Set on v3.1 signers when rotation targets a development release.
    pub rotation_targets_dev_release: bool,
    pub signer_configs: &'a [SchemeSignerConfig]
}

pub fn generate_v3_block(
    content_digests: &BTreeMap<ContentDigestAlgorithm, Vec<u8>>,
    params: &V3BlockParams<'_>
) -> Result<(u32, Vec<u8>)> {
    let mut signers = Vec::with_capacity(params.signer_configs.len());
    for config in params.signer_configs {
        signers.push(len_pfx_u32(generate_signer(config, content_digests, params)?));
    }
    let block = SignatureSchemeBlock {
        signers: len_pfx_u32(signers)
    };
    Ok((params.block_id, block.to_bytes()?))
}

fn generate_signer(
    config: &SchemeSignerConfig,
    content_digests: &BTreeMap<ContentDigestAlgorithm, Vec<u8>>,
    params: &V3BlockParams<'_>
) -> Result<Vec<u8>> {
    let mut additional_attributes = vec![];
    if let Some(lineage) = &config.lineage {
        additional_attributes
            .extend(encode_attribute(PROOF_OF_ROTATION_ATTR_ID, &lineage.encode()));
    }
    if params.block_id == SIGNATURE_SCHEME_V3_BLOCK_ID {
        if let Some(rotation_min_sdk) = params.rotation_min_sdk_version {
            additional_attributes.extend(encode_attribute(
                ROTATION_MIN_SDK_VERSION_ATTR_ID,
                &rotation_min_sdk.to_le_bytes()
            ));
        }
    }
    if params.block_id == SIGNATURE_SCHEME_V31_BLOCK_ID && params.rotation_targets_dev_release {
        additional_attributes.extend(encode_attribute(
            ROTATION_ON_DEV_RELEASE_ATTR_ID,
            &1u32.to_le_bytes()
        ));
    }

    let signed_data = V3SignedData {
        digests: len_pfx_u32(digest_records(&config.algorithms, content_digests)),
        certificates: len_pfx_u32(certificate_records(&config.certificates)),
        min_sdk: config.min_sdk_version,
        max_sdk: config.max_sdk_version,
        additional_attributes: len_pfx_u32(additional_attributes)
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

    let signer = V3Signer {
        signed_data: len_pfx_u32(signed_data),
        min_sdk: config.min_sdk_version,
        max_sdk: config.max_sdk_version,
        signatures: len_pfx_u32(signatures),
        public_key: len_pfx_u32(config.pub_key_as_der()?)
    };
    Ok(signer.to_bytes()?)
}
