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

//! The signing orchestrator.
//!
//! The engine is event driven: the caller streams input and output entry
//! names, fulfils the data requests the engine hands back, and only then
//! asks for the legacy signature entries and the signing block. Mutating
//! an entry after a signature was computed flips the scheme's pending bit
//! and the affected artifacts are recomputed on the next finalize call.
//!
//! Data requests are consumed on fulfilment, so a request cannot be
//! answered twice; once fulfilled, the buffered bytes are immutable for
//! the rest of the signing pass.

use std::collections::{BTreeMap, BTreeSet};

use reseal_common::*;
use sha2::{Digest as _, Sha256};

use crate::algorithms::{
    sdk, suggested_v2_algorithms, suggested_v3_algorithms, suggested_v4_algorithms,
    ContentDigestAlgorithm, VERSION_APK_SIGNATURE_SCHEME_V2, VERSION_APK_SIGNATURE_SCHEME_V3,
    VERSION_JAR_SIGNATURE_SCHEME
};
use crate::android_manifest::{is_debuggable, ANDROID_MANIFEST_ENTRY_NAME};
use crate::crypto_keys::{SchemeSignerConfig, SignerConfig};
use crate::digest::{compute_content_digests, Executor};
use crate::lineage::{resolve_scheme_windows, split_v31_configs, SigningCertificateLineage};
use crate::signing_block::{
    entries_padding, generate_apk_signing_block, parse_scheme_block_signers,
    parse_signing_block_pairs, DISCARDED_SIGNATURE_BLOCK_IDS, SIGNATURE_SCHEME_V2_BLOCK_ID,
    SIGNATURE_SCHEME_V31_BLOCK_ID, SIGNATURE_SCHEME_V3_BLOCK_ID
};
use crate::stamp::{
    generate_source_stamp_block, source_stamp_certificate_digest, SchemeDigestInfos,
    SOURCE_STAMP_CERTIFICATE_HASH_ZIP_ENTRY_NAME
};
use crate::v1_signing::{self, V1DigestAlgorithm, V1SignerConfig, MANIFEST_ENTRY_NAME};
use crate::v2_signing::generate_v2_block;
use crate::v3_signing::{generate_v3_block, V3BlockParams};
use crate::v4_signing::{generate_v4_signature, V4Signature, V4SignerConfig};
use crate::zip_parser::copy_with_modified_cd_offset;

/// What the caller should do with an input entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEntryPolicy {
    /// Don't copy this entry to the output; it is a leftover signature
    /// artifact (or a directory entry nothing digests).
    Skip,
    /// Copy the entry to the output as usual.
    Output,
    /// The engine will emit this entry itself; don't copy the input's
    /// version.
    OutputByEngine
}

/// Classification of an input entry, plus a data request when the engine
/// needs to see the input's bytes (only the input manifest).
pub struct InputEntryInstructions {
    pub policy: InputEntryPolicy,
    pub data_request: Option<EntryDataRequest>
}

/// A request for an entry's bytes. Fulfil it with
/// [SignerEngine::fulfill_entry]; the request is consumed, making a second
/// fulfilment unrepresentable.
#[must_use = "the engine cannot finalize while this request is outstanding"]
pub struct EntryDataRequest {
    entry_name: String
}

impl EntryDataRequest {
    pub fn entry_name(&self) -> &str {
        &self.entry_name
    }
}

/// One entry the engine asks the caller to write into the output archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JarEntry {
    pub name: String,
    pub data: Vec<u8>
}

/// The assembled signing block and the zero padding the caller must write
/// immediately before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningBlockRequest {
    pub signing_block: Vec<u8>,
    pub padding_before_block: usize
}

#[derive(Default)]
struct PendingInspection {
    digest: bool,
    buffer_android_manifest: bool,
    signature_entry: bool,
    input_manifest: bool
}

pub struct SignerEngineBuilder {
    signer_configs: Vec<SignerConfig>,
    min_sdk_version: u32,
    v1_enabled: bool,
    v2_enabled: bool,
    v3_enabled: bool,
    verity_enabled: bool,
    debuggable_apk_permitted: bool,
    other_signers_signatures_preserved: bool,
    created_by: String,
    lineage: Option<SigningCertificateLineage>,
    stamp_signer_config: Option<SignerConfig>,
    rotation_min_sdk_version: u32,
    rotation_targets_dev_release: bool,
    v4_signing_failures_fatal: bool,
    executor: Executor
}

impl SignerEngineBuilder {
    pub fn new(signer_configs: Vec<SignerConfig>, min_sdk_version: u32) -> SignerEngineBuilder {
        SignerEngineBuilder {
            signer_configs,
            min_sdk_version,
            v1_enabled: true,
            v2_enabled: true,
            v3_enabled: true,
            verity_enabled: false,
            debuggable_apk_permitted: true,
            other_signers_signatures_preserved: false,
            created_by: "1.0 (Android)".to_string(),
            lineage: None,
            stamp_signer_config: None,
            rotation_min_sdk_version: sdk::T,
            rotation_targets_dev_release: false,
            v4_signing_failures_fatal: true,
            executor: Executor::MultiThreaded
        }
    }

    pub fn v1_signing_enabled(mut self, enabled: bool) -> Self {
        self.v1_enabled = enabled;
        self
    }

    pub fn v2_signing_enabled(mut self, enabled: bool) -> Self {
        self.v2_enabled = enabled;
        self
    }

    pub fn v3_signing_enabled(mut self, enabled: bool) -> Self {
        self.v3_enabled = enabled;
        self
    }

    pub fn verity_enabled(mut self, enabled: bool) -> Self {
        self.verity_enabled = enabled;
        self
    }

    pub fn debuggable_apk_permitted(mut self, permitted: bool) -> Self {
        self.debuggable_apk_permitted = permitted;
        self
    }

    pub fn other_signers_signatures_preserved(mut self, preserved: bool) -> Self {
        self.other_signers_signatures_preserved = preserved;
        self
    }

    pub fn created_by(mut self, created_by: &str) -> Self {
        self.created_by = created_by.to_string();
        self
    }

    pub fn signing_certificate_lineage(mut self, lineage: SigningCertificateLineage) -> Self {
        self.lineage = Some(lineage);
        self
    }

    pub fn source_stamp_signer_config(mut self, config: SignerConfig) -> Self {
        self.stamp_signer_config = Some(config);
        self
    }

    pub fn rotation_min_sdk_version(mut self, version: u32) -> Self {
        self.rotation_min_sdk_version = version;
        self
    }

    pub fn rotation_targets_dev_release(mut self, targets: bool) -> Self {
        self.rotation_targets_dev_release = targets;
        self
    }

    /// Whether a v4 signing failure aborts [SignerEngine::sign_v4] or just
    /// yields no side artifact. v4 is supplementary, so a caller may
    /// explicitly opt into ignoring its failures; the default is fatal.
    pub fn v4_signing_failures_fatal(mut self, fatal: bool) -> Self {
        self.v4_signing_failures_fatal = fatal;
        self
    }

    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    pub fn build(self) -> Result<SignerEngine> {
        if self.signer_configs.is_empty() {
            return Err(ResealError::NoSignersConfigured);
        }
        if self.v3_enabled && self.signer_configs.len() > 1 && self.lineage.is_none() {
            return Err(ResealError::LineageIncompatible(
                "v3 signing supports multiple signers only as a rotation lineage; \
                 supply the signing certificate lineage"
                    .into()
            ));
        }

        let mut v1_signer_configs = vec![];
        let mut v1_content_digest_algorithm: Option<V1DigestAlgorithm> = None;
        let mut signature_expected_output_entry_names = BTreeSet::new();
        if self.v1_enabled {
            // v3 only supports a single signer, of which the oldest
            // (first) is the one to use for v1 and v2 signing
            let v1_signers: &[SignerConfig] = if self.v3_enabled {
                let oldest = &self.signer_configs[0];
                if let Some(lineage) = &self.lineage {
                    if lineage.sub_lineage(oldest.signing_certificate())?.size() != 1 {
                        return Err(ResealError::LineageIncompatible(
                            "v1 signing enabled but the oldest signer in the lineage is \
                             missing; provide the oldest signer to enable v1 signing"
                                .into()
                        ));
                    }
                }
                std::slice::from_ref(oldest)
            } else {
                &self.signer_configs
            };

            let mut names_seen: BTreeMap<String, usize> = BTreeMap::new();
            for (index, signer) in v1_signers.iter().enumerate() {
                let safe_name = v1_signing::get_safe_signer_name(&signer.name);
                if let Some(previous) = names_seen.insert(safe_name.clone(), index) {
                    return Err(ResealError::SignerNameCollision(format!(
                        "signers #{} and #{} map to the same v1 name {safe_name}",
                        previous + 1,
                        index + 1
                    )));
                }
                let algorithm =
                    v1_signing::suggested_signature_digest_algorithm(self.min_sdk_version);
                // When there are multiple signers, digest entries with the
                // strongest of their signature digest algorithms so no
                // signer's protection is weakened
                v1_content_digest_algorithm = Some(match v1_content_digest_algorithm {
                    None => algorithm,
                    Some(existing) => existing.max(algorithm)
                });
                v1_signer_configs.push(V1SignerConfig {
                    name: safe_name,
                    signer: signer.clone(),
                    signature_digest_algorithm: algorithm
                });
            }
            signature_expected_output_entry_names =
                v1_signing::output_entry_names(&v1_signer_configs);
        }

        let v1_enabled = self.v1_enabled;
        let v2_enabled = self.v2_enabled;
        let v3_enabled = self.v3_enabled;
        Ok(SignerEngine {
            signer_configs: self.signer_configs,
            min_sdk_version: self.min_sdk_version,
            v1_enabled,
            v2_enabled,
            v3_enabled,
            verity_enabled: self.verity_enabled,
            debuggable_apk_permitted: self.debuggable_apk_permitted,
            other_signers_signatures_preserved: self.other_signers_signatures_preserved,
            created_by: self.created_by,
            lineage: self.lineage,
            stamp_signer_config: self.stamp_signer_config,
            rotation_min_sdk_version: self.rotation_min_sdk_version,
            rotation_targets_dev_release: self.rotation_targets_dev_release,
            v4_signing_failures_fatal: self.v4_signing_failures_fatal,
            executor: self.executor,
            v1_signer_configs,
            v1_content_digest_algorithm,
            signature_expected_output_entry_names,
            v1_signature_pending: v1_enabled,
            v2_signature_pending: v2_enabled,
            v3_signature_pending: v3_enabled,
            pending_inspections: BTreeMap::new(),
            output_entry_digests: BTreeMap::new(),
            emitted_signature_entries: BTreeMap::new(),
            output_signature_entry_data: BTreeMap::new(),
            input_manifest: None,
            output_android_manifest: None,
            debuggable: None,
            cached_signing_block: None,
            preserved_signature_blocks: vec![],
            preserved_v2_signers: vec![]
        })
    }
}

pub struct SignerEngine {
    signer_configs: Vec<SignerConfig>,
    min_sdk_version: u32,
    v1_enabled: bool,
    v2_enabled: bool,
    v3_enabled: bool,
    verity_enabled: bool,
    debuggable_apk_permitted: bool,
    other_signers_signatures_preserved: bool,
    created_by: String,
    lineage: Option<SigningCertificateLineage>,
    stamp_signer_config: Option<SignerConfig>,
    rotation_min_sdk_version: u32,
    rotation_targets_dev_release: bool,
    v4_signing_failures_fatal: bool,
    executor: Executor,

    v1_signer_configs: Vec<V1SignerConfig>,
    v1_content_digest_algorithm: Option<V1DigestAlgorithm>,
    /// Names of entries this engine is expected to output as part of v1
    /// signing.
    signature_expected_output_entry_names: BTreeSet<String>,

    v1_signature_pending: bool,
    v2_signature_pending: bool,
    v3_signature_pending: bool,

    pending_inspections: BTreeMap<String, PendingInspection>,
    output_entry_digests: BTreeMap<String, Vec<u8>>,
    /// Entry data emitted by this engine as v1 signature.
    emitted_signature_entries: BTreeMap<String, Vec<u8>>,
    /// Bytes the caller actually wrote for engine-emitted entries.
    output_signature_entry_data: BTreeMap<String, Vec<u8>>,
    input_manifest: Option<Vec<u8>>,
    output_android_manifest: Option<Vec<u8>>,
    debuggable: Option<bool>,
    cached_signing_block: Option<SigningBlockRequest>,
    preserved_signature_blocks: Vec<(u32, Vec<u8>)>,
    preserved_v2_signers: Vec<Vec<u8>>
}

impl SignerEngine {
    pub fn builder(
        signer_configs: Vec<SignerConfig>,
        min_sdk_version: u32
    ) -> SignerEngineBuilder {
        SignerEngineBuilder::new(signer_configs, min_sdk_version)
    }

    /// Seeds per-entry digests from an existing MANIFEST.MF so unchanged
    /// entries don't need to be re-digested. Returns the names that were
    /// seeded (a subset of `entry_names`).
    pub fn init_with(
        &mut self,
        manifest_bytes: &[u8],
        entry_names: &BTreeSet<String>
    ) -> BTreeSet<String> {
        let Some(algorithm) = self.v1_content_digest_algorithm else {
            return BTreeSet::new();
        };
        let parsed = v1_signing::parse_manifest(manifest_bytes);
        let mut seeded = BTreeSet::new();
        for (name, attributes) in &parsed.entry_attributes {
            if !entry_names.contains(name) || !v1_signing::is_jar_entry_digest_needed(name) {
                continue;
            }
            if !self.debuggable_apk_permitted && name == ANDROID_MANIFEST_ENTRY_NAME {
                // The manifest must still be inspected for the debuggable
                // attribute, so don't short-circuit its digest
                continue;
            }
            if let Some(digest) = v1_signing::extract_entry_digest(attributes, algorithm) {
                self.output_entry_digests.insert(name.clone(), digest);
                seeded.insert(name.clone());
            }
        }
        seeded
    }

    /// Ingests the input archive's existing signing block so foreign
    /// signatures can be preserved alongside the new ones.
    pub fn input_signing_block(&mut self, signing_block: &[u8]) -> Result<()> {
        if !self.other_signers_signatures_preserved || signing_block.is_empty() {
            return Ok(());
        }
        let pairs = parse_signing_block_pairs(signing_block)?;
        let mut scheme_block_preserved = false;
        for (id, value) in pairs {
            match id {
                SIGNATURE_SCHEME_V2_BLOCK_ID => {
                    if self.v2_enabled {
                        // Carry over only the signers that are not part of
                        // the current signing request
                        for signer in parse_scheme_block_signers(&value)? {
                            if !self.is_configured_with_signer(&signer.certificates) {
                                self.preserved_v2_signers.push(signer.raw);
                                scheme_block_preserved = true;
                            }
                        }
                    } else {
                        self.preserved_signature_blocks.push((id, value));
                        scheme_block_preserved = true;
                    }
                }
                SIGNATURE_SCHEME_V3_BLOCK_ID => {
                    if !self.v3_enabled {
                        return Err(ResealError::ContractViolation(
                            "preserving an existing v3 signature is not supported".into()
                        ));
                    }
                    let signers = parse_scheme_block_signers(&value)?;
                    if signers.len() > 1 {
                        return Err(ResealError::MalformedSigningBlock(format!(
                            "existing v3 block has {} signers; v3 allows one",
                            signers.len()
                        )));
                    }
                    if signers.len() == 1
                        && !self.is_configured_with_signer(&signers[0].certificates)
                    {
                        return Err(ResealError::ContractViolation(
                            "the existing v3 signature belongs to a different signer and \
                             cannot be preserved"
                                .into()
                        ));
                    }
                }
                _ if DISCARDED_SIGNATURE_BLOCK_IDS.contains(&id) => {}
                _ => self.preserved_signature_blocks.push((id, value))
            }
        }
        if self.v3_enabled && scheme_block_preserved {
            return Err(ResealError::ContractViolation(
                "v3+ signing supports a single signer and cannot be appended to \
                 preserved scheme signature blocks"
                    .into()
            ));
        }
        Ok(())
    }

    fn is_configured_with_signer(&self, certificates: &[Vec<u8>]) -> bool {
        self.signer_configs.iter().any(|config| {
            config
                .certificates
                .iter()
                .all(|cert| certificates.contains(cert))
        })
    }

    /// Classifies an input entry and, for the input manifest, requests its
    /// bytes so the main attributes can be carried over.
    pub fn input_entry(&mut self, entry_name: &str) -> InputEntryInstructions {
        let policy = self.input_entry_policy(entry_name);
        let data_request = if policy == InputEntryPolicy::OutputByEngine
            && entry_name == MANIFEST_ENTRY_NAME
        {
            self.pending_inspections
                .entry(entry_name.to_string())
                .or_default()
                .input_manifest = true;
            Some(EntryDataRequest {
                entry_name: entry_name.to_string()
            })
        } else {
            None
        };
        InputEntryInstructions {
            policy,
            data_request
        }
    }

    /// Classification without a data request, for callers that delete
    /// input entries.
    pub fn input_entry_removed(&self, entry_name: &str) -> InputEntryPolicy {
        self.input_entry_policy(entry_name)
    }

    fn input_entry_policy(&self, entry_name: &str) -> InputEntryPolicy {
        if self.signature_expected_output_entry_names.contains(entry_name) {
            return InputEntryPolicy::OutputByEngine;
        }
        if self.other_signers_signatures_preserved
            || v1_signing::is_jar_entry_digest_needed(entry_name)
        {
            return InputEntryPolicy::Output;
        }
        InputEntryPolicy::Skip
    }

    /// Notes that an entry was written to the output. Returns a data
    /// request when the engine must see the entry's bytes.
    pub fn output_entry(&mut self, entry_name: &str) -> Option<EntryDataRequest> {
        if entry_name != MANIFEST_ENTRY_NAME {
            // Content changed, so any previously assembled signing block
            // no longer matches
            self.invalidate_modern_signatures();
        }

        let inspect_debuggable =
            !self.debuggable_apk_permitted && entry_name == ANDROID_MANIFEST_ENTRY_NAME;
        if inspect_debuggable {
            self.debuggable = None;
            self.output_android_manifest = None;
        }

        if !self.v1_enabled {
            if inspect_debuggable {
                self.pending_inspections
                    .entry(entry_name.to_string())
                    .or_default()
                    .buffer_android_manifest = true;
                return Some(EntryDataRequest {
                    entry_name: entry_name.to_string()
                });
            }
            return None;
        }

        if v1_signing::is_jar_entry_digest_needed(entry_name) {
            self.invalidate_v1_signature();
            self.output_entry_digests.remove(entry_name);
            let pending = self
                .pending_inspections
                .entry(entry_name.to_string())
                .or_default();
            pending.digest = true;
            pending.buffer_android_manifest |= inspect_debuggable;
            return Some(EntryDataRequest {
                entry_name: entry_name.to_string()
            });
        }

        if self.signature_expected_output_entry_names.contains(entry_name) {
            self.invalidate_v1_signature();
            let pending = self
                .pending_inspections
                .entry(entry_name.to_string())
                .or_default();
            pending.signature_entry = true;
            // The output manifest doubles as the source of borrowed main
            // attributes
            pending.input_manifest |= entry_name == MANIFEST_ENTRY_NAME;
            return Some(EntryDataRequest {
                entry_name: entry_name.to_string()
            });
        }

        None
    }

    /// Same invalidation semantics as [SignerEngine::output_entry], minus
    /// the data request.
    pub fn output_entry_removed(&mut self, entry_name: &str) {
        if entry_name != MANIFEST_ENTRY_NAME {
            self.invalidate_modern_signatures();
        }
        if !self.v1_enabled {
            return;
        }
        if v1_signing::is_jar_entry_digest_needed(entry_name) {
            self.invalidate_v1_signature();
            self.output_entry_digests.remove(entry_name);
            self.pending_inspections.remove(entry_name);
            self.output_signature_entry_data.remove(entry_name);
        } else if self.signature_expected_output_entry_names.contains(entry_name) {
            self.invalidate_v1_signature();
        }
    }

    /// Answers an outstanding data request. The buffered bytes are
    /// immutable for the remainder of the signing pass.
    pub fn fulfill_entry(&mut self, request: EntryDataRequest, data: &[u8]) -> Result<()> {
        let Some(pending) = self.pending_inspections.remove(&request.entry_name) else {
            return Err(ResealError::ContractViolation(format!(
                "no outstanding data request for {}",
                request.entry_name
            )));
        };
        if pending.digest {
            let algorithm = self
                .v1_content_digest_algorithm
                .expect("digest requests only exist when v1 signing is configured");
            self.output_entry_digests
                .insert(request.entry_name.clone(), algorithm.digest(data));
        }
        if pending.buffer_android_manifest {
            self.output_android_manifest = Some(data.to_vec());
            self.debuggable = None;
        }
        if pending.input_manifest {
            self.input_manifest = Some(data.to_vec());
        }
        if pending.signature_entry {
            self.output_signature_entry_data
                .insert(request.entry_name.clone(), data.to_vec());
        }
        Ok(())
    }

    /// Computes (or revalidates) the legacy signature. Returns the entries
    /// the caller must write, or `None` when the previously emitted v1
    /// signature is still valid, which makes re-signing an unchanged
    /// archive a no-op.
    pub fn finalize_entries(&mut self) -> Result<Option<Vec<JarEntry>>> {
        if !self.v1_enabled || !self.v1_signature_pending {
            return Ok(None);
        }
        self.check_no_outstanding_requests("finalize_entries")?;
        self.check_output_not_debuggable()?;

        let algorithm = self
            .v1_content_digest_algorithm
            .expect("v1 enabled implies a content digest algorithm");

        if self.is_eligible_for_source_stamp() {
            let content = source_stamp_certificate_digest(
                self.stamp_signer_config
                    .as_ref()
                    .unwrap()
                    .signing_certificate()
            );
            self.output_entry_digests.insert(
                SOURCE_STAMP_CERTIFICATE_HASH_ZIP_ENTRY_NAME.to_string(),
                algorithm.digest(&content)
            );
        }

        let scheme_ids = self.active_scheme_ids();
        let manifest = v1_signing::generate_manifest_file(
            algorithm,
            &self.output_entry_digests,
            self.input_manifest.as_deref(),
            &self.created_by
        );

        let signature_entries: Vec<(String, Vec<u8>)> = if self.emitted_signature_entries.is_empty()
        {
            v1_signing::sign_manifest(
                &self.v1_signer_configs,
                &scheme_ids,
                &self.created_by,
                &manifest
            )?
        } else if self.emitted_signature_entries.get(MANIFEST_ENTRY_NAME)
            != Some(&manifest.contents)
        {
            // Entry content changed since the last emission; the whole
            // signature set must be regenerated
            v1_signing::sign_manifest(
                &self.v1_signer_configs,
                &scheme_ids,
                &self.created_by,
                &manifest
            )?
        } else {
            // The emitted signature is still valid; re-emit only what the
            // output is missing or has wrong
            let stale: Vec<(String, Vec<u8>)> = self
                .emitted_signature_entries
                .iter()
                .filter(|(name, expected)| {
                    self.output_signature_entry_data.get(*name) != Some(*expected)
                })
                .map(|(name, expected)| (name.clone(), expected.clone()))
                .collect();
            if stale.is_empty() {
                self.v1_signature_pending = false;
                return Ok(None);
            }
            stale
        };

        let mut entries = Vec::with_capacity(signature_entries.len());
        for (name, data) in signature_entries {
            self.emitted_signature_entries.insert(name.clone(), data.clone());
            entries.push(JarEntry { name, data });
        }
        Ok(Some(entries))
    }

    /// Digests the final zip sections and assembles the signing block for
    /// every enabled modern scheme plus the source stamp. `None` when no
    /// modern scheme and no stamp is active.
    pub fn finalize_zip_sections(
        &mut self,
        zip_entries: &[u8],
        central_directory: &[u8],
        eocd: &[u8]
    ) -> Result<Option<SigningBlockRequest>> {
        self.check_no_outstanding_requests("finalize_zip_sections")?;
        self.check_v1_signing_done()?;
        if !self.v2_enabled && !self.v3_enabled && !self.is_eligible_for_source_stamp() {
            return Ok(None);
        }
        self.check_output_not_debuggable()?;

        if let Some(cached) = &self.cached_signing_block {
            if !self.v2_signature_pending && !self.v3_signature_pending {
                return Ok(Some(cached.clone()));
            }
        }

        // Zero-pad the entries region so the block lands on a page
        // boundary, and digest an EOCD whose central directory offset
        // already accounts for the inserted bytes
        let padding_before_block = entries_padding(zip_entries.len());
        let mut before_central_directory =
            Vec::with_capacity(zip_entries.len() + padding_before_block);
        before_central_directory.extend_from_slice(zip_entries);
        before_central_directory.resize(zip_entries.len() + padding_before_block, 0);
        let patched_eocd =
            copy_with_modified_cd_offset(eocd, before_central_directory.len() as u32);
        let regions: [&[u8]; 3] = [&before_central_directory, central_directory, &patched_eocd];

        let mut scheme_blocks: Vec<(u32, Vec<u8>)> = self.preserved_signature_blocks.clone();
        let mut v2_digest_info: Option<BTreeMap<ContentDigestAlgorithm, Vec<u8>>> = None;
        let mut v3_digest_info: Option<BTreeMap<ContentDigestAlgorithm, Vec<u8>>> = None;

        if self.v2_enabled {
            let configs = self.create_v2_signer_configs()?;
            let algorithms: BTreeSet<ContentDigestAlgorithm> = configs
                .iter()
                .flat_map(|c| c.algorithms.iter().map(|a| a.content_digest_algorithm()))
                .collect();
            let digests = compute_content_digests(&algorithms, &regions, self.executor)?;
            scheme_blocks.push(generate_v2_block(
                &digests,
                &configs,
                self.v3_enabled,
                &self.preserved_v2_signers
            )?);
            v2_digest_info = Some(digests);
        }

        if self.v3_enabled {
            let mut v3_configs = resolve_scheme_windows(
                self.create_v3_signer_configs(),
                self.min_sdk_version,
                self.rotation_min_sdk_version,
                self.rotation_targets_dev_release,
                self.lineage.as_ref()
            )?;
            let v31_configs = if self.lineage_has_v31_support() {
                split_v31_configs(&mut v3_configs, self.rotation_min_sdk_version)
            } else {
                vec![]
            };

            let algorithms: BTreeSet<ContentDigestAlgorithm> = v3_configs
                .iter()
                .chain(&v31_configs)
                .flat_map(|c| c.algorithms.iter().map(|a| a.content_digest_algorithm()))
                .collect();
            let digests = compute_content_digests(&algorithms, &regions, self.executor)?;

            if !v31_configs.is_empty() {
                scheme_blocks.push(generate_v3_block(
                    &digests,
                    &V3BlockParams {
                        block_id: SIGNATURE_SCHEME_V31_BLOCK_ID,
                        rotation_min_sdk_version: None,
                        rotation_targets_dev_release: self.rotation_targets_dev_release,
                        signer_configs: &v31_configs
                    }
                )?);
            }
            scheme_blocks.push(generate_v3_block(
                &digests,
                &V3BlockParams {
                    block_id: SIGNATURE_SCHEME_V3_BLOCK_ID,
                    rotation_min_sdk_version: self
                        .lineage_has_v31_support()
                        .then_some(self.rotation_min_sdk_version),
                    rotation_targets_dev_release: self.rotation_targets_dev_release,
                    signer_configs: &v3_configs
                }
            )?);
            v3_digest_info = Some(digests);
        }

        if self.is_eligible_for_source_stamp() {
            let mut digest_infos = SchemeDigestInfos::new();
            if self.v1_enabled {
                let algorithm = self.v1_content_digest_algorithm.unwrap();
                let manifest = v1_signing::generate_manifest_file(
                    algorithm,
                    &self.output_entry_digests,
                    self.input_manifest.as_deref(),
                    &self.created_by
                );
                digest_infos.insert(
                    VERSION_JAR_SIGNATURE_SCHEME,
                    [(
                        ContentDigestAlgorithm::Sha256,
                        Sha256::digest(&manifest.contents).to_vec()
                    )]
                    .into()
                );
            }
            if let Some(digests) = &v2_digest_info {
                digest_infos.insert(VERSION_APK_SIGNATURE_SCHEME_V2, digests.clone());
            }
            if let Some(digests) = &v3_digest_info {
                digest_infos.insert(VERSION_APK_SIGNATURE_SCHEME_V3, digests.clone());
            }
            let stamp_config = self.create_stamp_signer_config()?;
            scheme_blocks.push(generate_source_stamp_block(&stamp_config, &digest_infos)?);
        }

        let signing_block = generate_apk_signing_block(&scheme_blocks, true)?;
        let request = SigningBlockRequest {
            signing_block,
            padding_before_block
        };
        self.cached_signing_block = Some(request.clone());
        self.v2_signature_pending = false;
        self.v3_signature_pending = false;
        Ok(Some(request))
    }

    /// Verifies the whole protocol ran to completion: the legacy entries
    /// were written back unmodified and the signing block was produced.
    pub fn output_done(&mut self) -> Result<()> {
        self.check_v1_signing_done()?;
        if (self.v2_enabled || self.v3_enabled) && self.cached_signing_block.is_none() {
            return Err(ResealError::ContractViolation(
                "signing block not yet generated; skipped finalize_zip_sections?".into()
            ));
        }
        Ok(())
    }

    /// Produces the v4 signature file contents and verity tree over the
    /// final signed archive. Returns `None` when v4 signing fails and the
    /// engine was configured to ignore v4 failures.
    pub fn sign_v4(&self, signed_apk: &[u8]) -> Result<Option<(V4Signature, Vec<u8>)>> {
        match self.try_sign_v4(signed_apk) {
            Ok(result) => Ok(Some(result)),
            Err(_) if !self.v4_signing_failures_fatal => Ok(None),
            Err(error) => Err(error)
        }
    }

    fn try_sign_v4(&self, signed_apk: &[u8]) -> Result<(V4Signature, Vec<u8>)> {
        let mut raw_configs = Vec::with_capacity(self.signer_configs.len());
        for signer in &self.signer_configs {
            let algorithms =
                suggested_v4_algorithms(&signer.public_key, self.min_sdk_version)?;
            raw_configs.push(SchemeSignerConfig::new(signer, algorithms, 0, sdk::MAX));
        }
        let (v4_config, v41_config) = if raw_configs.len() == 1 {
            (raw_configs.remove(0), None)
        } else {
            // v4 connects back to v3, so reuse the same window filtering
            let mut resolved = resolve_scheme_windows(
                raw_configs,
                self.min_sdk_version,
                self.rotation_min_sdk_version,
                self.rotation_targets_dev_release,
                self.lineage.as_ref()
            )?;
            let mut v41 = if self.lineage_has_v31_support() {
                split_v31_configs(&mut resolved, self.rotation_min_sdk_version)
            } else {
                vec![]
            };
            if resolved.len() != 1 {
                return Err(ResealError::KeyAlgorithmUnsupported(
                    "v4 signing accepts exactly one signer config".into()
                ));
            }
            (resolved.remove(0), v41.pop())
        };
        generate_v4_signature(
            signed_apk,
            &V4SignerConfig {
                v4: v4_config,
                v41: v41_config
            }
        )
    }

    pub fn is_eligible_for_source_stamp(&self) -> bool {
        self.stamp_signer_config.is_some()
            && (self.v1_enabled || self.v2_enabled || self.v3_enabled)
    }

    /// The `stamp-cert-sha256` entry the caller must add to the archive
    /// when source stamping is active: its content is the SHA-256 of the
    /// stamp signer's certificate.
    pub fn source_stamp_certificate_entry(&self) -> Option<JarEntry> {
        if !self.is_eligible_for_source_stamp() {
            return None;
        }
        let stamp = self.stamp_signer_config.as_ref()?;
        Some(JarEntry {
            name: SOURCE_STAMP_CERTIFICATE_HASH_ZIP_ENTRY_NAME.to_string(),
            data: source_stamp_certificate_digest(stamp.signing_certificate())
        })
    }

    /// Releases the engine. Consuming `self` makes any further call on a
    /// closed engine a compile-time impossibility.
    pub fn close(self) {}

    fn active_scheme_ids(&self) -> Vec<u32> {
        let mut ids = vec![];
        if self.v2_enabled {
            ids.push(VERSION_APK_SIGNATURE_SCHEME_V2);
        }
        if self.v3_enabled {
            ids.push(VERSION_APK_SIGNATURE_SCHEME_V3);
        }
        ids
    }

    fn lineage_has_v31_support(&self) -> bool {
        self.lineage.is_some()
            && self.rotation_min_sdk_version >= sdk::T
            && self.min_sdk_version < self.rotation_min_sdk_version
    }

    fn create_v2_signer_configs(&self) -> Result<Vec<SchemeSignerConfig>> {
        let signers: &[SignerConfig] = if self.v3_enabled {
            // v3 only supports a single signer; the oldest is the v2
            // identity
            let oldest = &self.signer_configs[0];
            if let Some(lineage) = &self.lineage {
                if lineage.sub_lineage(oldest.signing_certificate())?.size() != 1 {
                    return Err(ResealError::LineageIncompatible(
                        "v2 signing enabled but the oldest signer in the lineage is \
                         missing; provide the oldest signer to enable v2 signing"
                            .into()
                    ));
                }
            }
            std::slice::from_ref(oldest)
        } else {
            &self.signer_configs
        };
        Ok(signers
            .iter()
            .map(|signer| {
                SchemeSignerConfig::new(
                    signer,
                    suggested_v2_algorithms(
                        &signer.public_key,
                        self.min_sdk_version,
                        self.verity_enabled
                    ),
                    self.min_sdk_version,
                    sdk::MAX
                )
            })
            .collect())
    }

    fn create_v3_signer_configs(&self) -> Vec<SchemeSignerConfig> {
        self.signer_configs
            .iter()
            .map(|signer| {
                SchemeSignerConfig::new(
                    signer,
                    suggested_v3_algorithms(
                        &signer.public_key,
                        self.min_sdk_version,
                        self.verity_enabled
                    ),
                    self.min_sdk_version,
                    sdk::MAX
                )
            })
            .collect()
    }

    fn create_stamp_signer_config(&self) -> Result<SchemeSignerConfig> {
        let stamp = self
            .stamp_signer_config
            .as_ref()
            .expect("checked by is_eligible_for_source_stamp");
        Ok(SchemeSignerConfig::new(
            stamp,
            vec![crate::algorithms::SignatureAlgorithm::RsaPkcs1V15WithSha256],
            self.min_sdk_version,
            sdk::MAX
        ))
    }

    fn invalidate_v1_signature(&mut self) {
        if self.v1_enabled {
            self.v1_signature_pending = true;
        }
        self.invalidate_modern_signatures();
    }

    fn invalidate_modern_signatures(&mut self) {
        if self.v2_enabled {
            self.v2_signature_pending = true;
        }
        if self.v3_enabled {
            self.v3_signature_pending = true;
        }
        self.cached_signing_block = None;
    }

    fn check_no_outstanding_requests(&self, operation: &str) -> Result<()> {
        if let Some(name) = self.pending_inspections.keys().next() {
            return Err(ResealError::ContractViolation(format!(
                "{operation} called while still waiting for the contents of {name}"
            )));
        }
        Ok(())
    }

    fn check_v1_signing_done(&mut self) -> Result<()> {
        if !self.v1_enabled || !self.v1_signature_pending {
            return Ok(());
        }
        if self.emitted_signature_entries.is_empty() {
            return Err(ResealError::ContractViolation(
                "v1 signature not yet generated; skipped finalize_entries?".into()
            ));
        }
        for (name, expected) in &self.emitted_signature_entries {
            match self.output_signature_entry_data.get(name) {
                None => {
                    return Err(ResealError::ContractViolation(format!(
                        "entry {name} not yet output despite being requested"
                    )))
                }
                Some(actual) if actual != expected => {
                    return Err(ResealError::ContractViolation(format!(
                        "output entry {name} differs from what the engine emitted"
                    )))
                }
                Some(_) => {}
            }
        }
        self.v1_signature_pending = false;
        Ok(())
    }

    fn check_output_not_debuggable(&mut self) -> Result<()> {
        if self.debuggable_apk_permitted {
            return Ok(());
        }
        let debuggable = match self.debuggable {
            Some(value) => value,
            None => {
                let Some(manifest) = &self.output_android_manifest else {
                    return Err(ResealError::ContractViolation(format!(
                        "cannot determine the debuggable status: the contents of \
                         {ANDROID_MANIFEST_ENTRY_NAME} have not been supplied"
                    )));
                };
                let value = is_debuggable(manifest)?;
                self.debuggable = Some(value);
                value
            }
        };
        if debuggable {
            return Err(ResealError::DebuggableApkRejected(
                ANDROID_MANIFEST_ENTRY_NAME.to_string()
            ));
        }
        Ok(())
    }
}
