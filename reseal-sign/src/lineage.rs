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

//! Certificate rotation history and the resolver that decides which
//! signer covers which platform version range.
//!
//! A lineage is an ordered chain, oldest first; each link after the first
//! carries the parent key's signature over the child certificate, proving
//! the rotation. The resolver walks signers newest-first and assigns each
//! a `[min_sdk, max_sdk]` window so the whole chain covers every version
//! from the engine's minimum upwards with no gaps and no overlaps.

use reseal_common::*;

use crate::algorithms::{sdk, SignatureAlgorithm};
use crate::crypto::sign_data;
use crate::crypto_keys::{SchemeSignerConfig, SignerConfig};
use crate::signing_block::SliceReader;

pub const LINEAGE_MAGIC: u32 = 0x3EFF_39D1;
pub const LINEAGE_VERSION: u32 = 1;

/// Default capabilities granted to a past certificate: installed data,
/// shared uid, permission and auth; rollback stays off.
pub const DEFAULT_CAPABILITIES: u32 = 0x17;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageNode {
    /// Certificate in DER form.
    pub signing_certificate: Vec<u8>,
    /// Signature algorithm the *parent* used to sign this certificate;
    /// zero for the first link.
    pub parent_signature_algorithm_id: u32,
    /// Signature algorithm this node will use to sign its successor.
    pub signature_algorithm_id: u32,
    /// Parent's signature over this node's signed data; empty for the
    /// first link.
    pub signature: Vec<u8>,
    /// Capability flags granted to this certificate once rotated past.
    pub flags: u32
}

impl LineageNode {
    /// The byte sequence the parent signs: the child certificate and the
    /// algorithm the parent signs with.
    fn signed_data(certificate: &[u8], parent_algorithm_id: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(8 + certificate.len());
        data.extend_from_slice(&(certificate.len() as u32).to_le_bytes());
        data.extend_from_slice(certificate);
        data.extend_from_slice(&parent_algorithm_id.to_le_bytes());
        data
    }
}

/// Ordered history of signing certificates, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SigningCertificateLineage {
    pub nodes: Vec<LineageNode>
}

impl SigningCertificateLineage {
    /// Starts a lineage at its first (oldest) certificate.
    pub fn new(first: &SignerConfig, signature_algorithm: SignatureAlgorithm) -> Self {
        SigningCertificateLineage {
            nodes: vec![LineageNode {
                signing_certificate: first.signing_certificate().to_vec(),
                parent_signature_algorithm_id: 0,
                signature_algorithm_id: signature_algorithm.id(),
                signature: vec![],
                flags: DEFAULT_CAPABILITIES
            }]
        }
    }

    /// Rotates to a new signer: the current newest key signs the new
    /// certificate, attesting that it supersedes the old one.
    pub fn spawn_descendant(
        &self,
        parent: &SignerConfig,
        child: &SignerConfig,
        child_signature_algorithm: SignatureAlgorithm
    ) -> Result<SigningCertificateLineage> {
        let newest = self.nodes.last().ok_or_else(|| {
            ResealError::LineageIncompatible("cannot rotate an empty lineage".into())
        })?;
        if newest.signing_certificate != parent.signing_certificate() {
            return Err(ResealError::LineageIncompatible(
                "rotation parent is not the newest certificate in the lineage".into()
            ));
        }
        let parent_algorithm = SignatureAlgorithm::from_id(newest.signature_algorithm_id)
            .ok_or_else(|| {
                ResealError::LineageIncompatible(format!(
                    "unknown lineage signature algorithm id 0x{:04x}",
                    newest.signature_algorithm_id
                ))
            })?;
        let signed_data =
            LineageNode::signed_data(child.signing_certificate(), parent_algorithm.id());
        let signature = sign_data(&parent.private_key, parent_algorithm, &signed_data)?;

        let mut rotated = self.clone();
        rotated.nodes.push(LineageNode {
            signing_certificate: child.signing_certificate().to_vec(),
            parent_signature_algorithm_id: parent_algorithm.id(),
            signature_algorithm_id: child_signature_algorithm.id(),
            signature,
            flags: DEFAULT_CAPABILITIES
        });
        Ok(rotated)
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// The lineage truncated at (and including) the given certificate.
    /// Fails when the certificate is not part of the history at all.
    pub fn sub_lineage(&self, certificate: &[u8]) -> Result<SigningCertificateLineage> {
        for (index, node) in self.nodes.iter().enumerate() {
            if node.signing_certificate == certificate {
                return Ok(SigningCertificateLineage {
                    nodes: self.nodes[..=index].to_vec()
                });
            }
        }
        Err(ResealError::LineageIncompatible(
            "certificate not present in the signing history".into()
        ))
    }

    /// Serialized form carried in the v3 proof-of-rotation attribute:
    /// magic ‖ version ‖ length-prefixed nodes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&LINEAGE_MAGIC.to_le_bytes());
        out.extend_from_slice(&LINEAGE_VERSION.to_le_bytes());
        for node in &self.nodes {
            let signed_data = LineageNode::signed_data(
                &node.signing_certificate,
                node.parent_signature_algorithm_id
            );
            let mut body = Vec::new();
            body.extend_from_slice(&(signed_data.len() as u32).to_le_bytes());
            body.extend_from_slice(&signed_data);
            body.extend_from_slice(&node.flags.to_le_bytes());
            body.extend_from_slice(&node.signature_algorithm_id.to_le_bytes());
            body.extend_from_slice(&(node.signature.len() as u32).to_le_bytes());
            body.extend_from_slice(&node.signature);
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&body);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<SigningCertificateLineage> {
        let malformed = |what: &str| {
            ResealError::LineageIncompatible(format!("malformed encoded lineage: {what}"))
        };
        let mut reader = SliceReader::new(bytes);
        if reader.read_u32().map_err(|_| malformed("missing magic"))? != LINEAGE_MAGIC {
            return Err(malformed("bad magic"));
        }
        if reader.read_u32().map_err(|_| malformed("missing version"))? != LINEAGE_VERSION {
            return Err(malformed("unsupported version"));
        }
        let mut nodes = vec![];
        while reader.remaining() > 0 {
            let node_bytes = reader
                .length_prefixed()
                .map_err(|_| malformed("truncated node"))?;
            let mut node = SliceReader::new(node_bytes);
            let signed_data = node
                .length_prefixed()
                .map_err(|_| malformed("truncated signed data"))?;
            let mut signed = SliceReader::new(signed_data);
            let certificate = signed
                .length_prefixed()
                .map_err(|_| malformed("truncated certificate"))?
                .to_vec();
            let parent_signature_algorithm_id =
                signed.read_u32().map_err(|_| malformed("missing parent algorithm"))?;
            let flags = node.read_u32().map_err(|_| malformed("missing flags"))?;
            let signature_algorithm_id =
                node.read_u32().map_err(|_| malformed("missing algorithm"))?;
            let signature = node
                .length_prefixed()
                .map_err(|_| malformed("truncated signature"))?
                .to_vec();
            nodes.push(LineageNode {
                signing_certificate: certificate,
                parent_signature_algorithm_id,
                signature_algorithm_id,
                signature,
                flags
            });
        }
        if nodes.is_empty() {
            return Err(malformed("no nodes"));
        }
        Ok(SigningCertificateLineage { nodes })
    }
}

/// Lowest SDK at which any of the signer's algorithms is usable; short
/// circuits as soon as an algorithm already satisfies the engine floor.
fn min_sdk_of_algorithms(algorithms: &[SignatureAlgorithm], engine_min_sdk: u32) -> u32 {
    let mut min = sdk::MAX;
    for algorithm in algorithms {
        let current = algorithm.min_sdk_version();
        if current < min {
            if current <= engine_min_sdk || current <= sdk::P {
                return current;
            }
            min = current;
        }
    }
    min
}

/// Assigns each raw v3 signer config its SDK window, newest-first, so the
/// set partitions `[engine_min_sdk, ∞)`. The returned list is newest
/// first. Signers older than needed are dropped; a remaining gap below
/// the floor is a configuration error.
pub fn resolve_scheme_windows(
    raw_configs: Vec<SchemeSignerConfig>,
    engine_min_sdk: u32,
    rotation_min_sdk: u32,
    rotation_targets_dev_release: bool,
    lineage: Option<&SigningCertificateLineage>
) -> Result<Vec<SchemeSignerConfig>> {
    let mut processed = vec![];
    let mut current_min_sdk = sdk::MAX;
    let newest_index = raw_configs.len() - 1;

    for (index, mut config) in raw_configs.into_iter().enumerate().rev() {
        if config.algorithms.is_empty() {
            // No valid algorithm was found for this signer and platform
            // versions remain uncovered
            return Err(ResealError::KeyAlgorithmUnsupported(
                "signer has no usable signature algorithm but the targeted platform \
                 range is not yet covered"
                    .into()
            ));
        }
        if index == newest_index {
            // The newest signer carries all future platform versions
            config.max_sdk_version = sdk::MAX;
        } else if rotation_targets_dev_release && current_min_sdk == rotation_min_sdk {
            // Dev-release special case: the rotation boundary version is
            // both the active development release and the newest shipped
            // platform, so the older signer's window overlaps it by one
            // version to keep the shipped platform consistent
            config.max_sdk_version = current_min_sdk;
        } else {
            config.max_sdk_version = current_min_sdk - 1;
        }
        config.min_sdk_version = min_sdk_of_algorithms(&config.algorithms, engine_min_sdk);

        // Only attach rotation history where the window reaches into the
        // rotation range
        if let Some(lineage) = lineage {
            let covers_rotation = if rotation_targets_dev_release {
                config.max_sdk_version > rotation_min_sdk
            } else {
                config.max_sdk_version >= rotation_min_sdk
            };
            if covers_rotation {
                config.lineage = Some(lineage.sub_lineage(config.signing_certificate())?);
                if config.min_sdk_version < rotation_min_sdk {
                    config.min_sdk_version = rotation_min_sdk;
                }
            }
        }

        current_min_sdk = config.min_sdk_version;
        processed.push(config);

        if (rotation_targets_dev_release && current_min_sdk < engine_min_sdk)
            || (!rotation_targets_dev_release && current_min_sdk <= engine_min_sdk)
            || current_min_sdk <= sdk::P
        {
            // Coverage reaches the floor, older signers are unnecessary
            break;
        }
    }

    if current_min_sdk > sdk::P && current_min_sdk > engine_min_sdk {
        return Err(ResealError::LineageIncompatible(
            "no combination of signers covers all targeted platform versions".into()
        ));
    }

    Ok(processed)
}

/// Pulls the signers that belong in a v3.1 block (window starting at or
/// above the rotation minimum) out of the resolved v3 list.
pub fn split_v31_configs(
    v3_configs: &mut Vec<SchemeSignerConfig>,
    rotation_min_sdk: u32
) -> Vec<SchemeSignerConfig> {
    let mut v31 = vec![];
    v3_configs.retain(|config| {
        if config.min_sdk_version >= rotation_min_sdk {
            v31.push(config.clone());
            false
        } else {
            true
        }
    });
    v31
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::ContentDigestAlgorithm;

    fn dummy_config(algorithms: Vec<SignatureAlgorithm>) -> SchemeSignerConfig {
        // Key material is irrelevant to window resolution; reuse one tiny
        // key to keep the test fast.
        use rsa::RsaPrivateKey;
        use std::sync::OnceLock;
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        let key = KEY
            .get_or_init(|| {
                use rand::SeedableRng;
                let mut rng = rand::rngs::StdRng::seed_from_u64(7);
                RsaPrivateKey::new(&mut rng, 512).unwrap()
            })
            .clone();
        SchemeSignerConfig {
            certificates: vec![vec![0xde, 0xad]],
            public_key: rsa::RsaPublicKey::from(&key),
            private_key: key,
            algorithms,
            min_sdk_version: 0,
            max_sdk_version: 0,
            lineage: None
        }
    }

    #[test]
    fn single_signer_covers_everything() {
        let configs = vec![dummy_config(vec![SignatureAlgorithm::RsaPkcs1V15WithSha256])];
        let resolved = resolve_scheme_windows(configs, sdk::N, sdk::T, false, None).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].min_sdk_version, sdk::N);
        assert_eq!(resolved[0].max_sdk_version, sdk::MAX);
    }

    #[test]
    fn verity_only_signer_cannot_reach_the_floor_alone() {
        // A signer whose only algorithm needs P cannot cover N..P by itself
        let configs = vec![dummy_config(vec![
            SignatureAlgorithm::VerityRsaPkcs1V15WithSha256,
        ])];
        let resolved = resolve_scheme_windows(configs, sdk::N, sdk::T, false, None).unwrap();
        // P is the scheme floor, so coverage down to P is accepted
        assert_eq!(resolved[0].min_sdk_version, sdk::P);
        assert_eq!(
            resolved[0]
                .algorithms
                .iter()
                .map(|a| a.content_digest_algorithm())
                .collect::<Vec<_>>(),
            vec![ContentDigestAlgorithm::VerityChunkedSha256]
        );
    }

    #[test]
    fn v31_split_takes_the_rotated_signer() {
        let mut resolved = vec![
            {
                let mut c = dummy_config(vec![SignatureAlgorithm::RsaPkcs1V15WithSha256]);
                c.min_sdk_version = sdk::T;
                c.max_sdk_version = sdk::MAX;
                c
            },
            {
                let mut c = dummy_config(vec![SignatureAlgorithm::RsaPkcs1V15WithSha256]);
                c.min_sdk_version = sdk::N;
                c.max_sdk_version = sdk::T - 1;
                c
            },
        ];
        let v31 = split_v31_configs(&mut resolved, sdk::T);
        assert_eq!(v31.len(), 1);
        assert_eq!(v31[0].min_sdk_version, sdk::T);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].max_sdk_version, sdk::T - 1);
    }
}
