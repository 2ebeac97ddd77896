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

//! # RESEAL signing engine
//!
//! Re-signs a rewritten APK under every platform signature scheme at
//! once: the legacy JAR scheme (v1), the APK Signing Block schemes
//! (v2, v3, v3.1), the supplementary v4 side file, and an optional source
//! stamp.
//!
//! The [engine::SignerEngine] is the event-driven core; [sign_apk_buffer]
//! drives it over an in-memory archive for callers that don't need
//! streaming.

use std::io::Cursor;

use reseal_common::Result;

use crate::engine::InputEntryPolicy;
use crate::zip_parser::{find_offsets, split_sections};
use crate::zip_rebuilder::rebuild_zip_with_signing_block;

pub mod algorithms;
mod android_manifest;
pub mod crypto;
pub mod crypto_keys;
pub mod digest;
pub mod engine;
pub mod lineage;
pub mod signing_block;
mod signing_types;
pub mod stamp;
pub mod v1_signing;
mod v2_signing;
mod v3_signing;
pub mod v4_signing;
pub mod zip_parser;
pub mod zip_rebuilder;
pub mod verity;

pub use crypto_keys::SignerConfig;
pub use engine::{SignerEngine, SignerEngineBuilder};
pub use signing_block::{
    SIGNATURE_SCHEME_V2_BLOCK_ID, SIGNATURE_SCHEME_V31_BLOCK_ID, SIGNATURE_SCHEME_V3_BLOCK_ID,
    V2_SOURCE_STAMP_BLOCK_ID, VERITY_PADDING_BLOCK_ID
};

// APK Signature Scheme v2 based on https://source.android.com/docs/security/features/apksigning/v2
// APK Signature Scheme v3 based on https://source.android.com/docs/security/features/apksigning/v3
/// Signs a ZIP file buffer, adding an APK Signing Block before its Central
/// Directory and regenerating the legacy JAR signature when enabled.
///
/// This streams the buffer's entries through the engine's full protocol:
/// classify input entries, output the survivors, fulfil inspection
/// requests, emit the legacy signature entries, then digest the zip
/// sections and insert the signing block.
pub fn sign_apk_buffer(apk_buf: &[u8], engine: &mut SignerEngine) -> Result<Vec<u8>> {
    // Hand an existing signing block to the engine first, in case foreign
    // signatures should be preserved
    if let Ok(offsets) = find_offsets(apk_buf) {
        if let Some(block) = existing_signing_block(apk_buf, offsets.cd_start) {
            engine.input_signing_block(block)?;
        }
    }

    let stamp_entry = engine.source_stamp_certificate_entry();

    let input_files = reseal_zip::read_entries(apk_buf)?;
    let mut output_files: Vec<reseal_zip::File> = vec![];
    for file in input_files {
        if stamp_entry.is_some() && file.path == stamp::SOURCE_STAMP_CERTIFICATE_HASH_ZIP_ENTRY_NAME
        {
            // A previous stamp entry is regenerated below
            continue;
        }
        let instructions = engine.input_entry(&file.path);
        if let Some(request) = instructions.data_request {
            engine.fulfill_entry(request, &file.data)?;
        }
        match instructions.policy {
            InputEntryPolicy::Skip | InputEntryPolicy::OutputByEngine => continue,
            InputEntryPolicy::Output => {}
        }
        if let Some(request) = engine.output_entry(&file.path) {
            engine.fulfill_entry(request, &file.data)?;
        }
        output_files.push(file);
    }

    if let Some(entry) = stamp_entry {
        if let Some(request) = engine.output_entry(&entry.name) {
            engine.fulfill_entry(request, &entry.data)?;
        }
        output_files.push(reseal_zip::File {
            path: entry.name,
            data: entry.data
        });
    }

    if let Some(signature_entries) = engine.finalize_entries()? {
        for entry in signature_entries {
            if let Some(request) = engine.output_entry(&entry.name) {
                engine.fulfill_entry(request, &entry.data)?;
            }
            output_files.push(reseal_zip::File {
                path: entry.name,
                data: entry.data
            });
        }
    }

    let mut unsigned = Cursor::new(Vec::new());
    reseal_zip::zip_apk(&output_files, &mut unsigned)?;
    let unsigned = unsigned.into_inner();

    let offsets = find_offsets(&unsigned)?;
    let (entries, central_directory, eocd) = split_sections(&unsigned, &offsets);
    let signed = match engine.finalize_zip_sections(entries, central_directory, eocd)? {
        Some(request) => rebuild_zip_with_signing_block(
            &offsets,
            &unsigned,
            request.padding_before_block,
            &request.signing_block
        )?,
        None => unsigned
    };
    engine.output_done()?;
    Ok(signed)
}

/// Borrows the serialized signing block sitting before the central
/// directory, when the archive has one.
fn existing_signing_block(apk_buf: &[u8], cd_start: usize) -> Option<&[u8]> {
    if cd_start < 32 {
        return None;
    }
    let footer = &apk_buf[cd_start - 24..cd_start];
    if &footer[8..24] != signing_block::APK_SIGNING_BLOCK_MAGIC {
        return None;
    }
    let size = u64::from_le_bytes(footer[..8].try_into().unwrap()) as usize;
    if size < 24 || size + 8 > cd_start {
        return None;
    }
    Some(&apk_buf[cd_start - size - 8..cd_start])
}
