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

use reseal_common::*;

use crate::zip_parser::{copy_with_modified_cd_offset, split_sections, ZipSections};

/// Reassembles the archive with the signing block (and its pre-block zero
/// padding) inserted between the entries and the central directory. The
/// EOCD's central-directory offset is patched to the new location.
pub fn rebuild_zip_with_signing_block(
    offsets: &ZipSections,
    zip_buf: &[u8],
    padding_before_block: usize,
    signing_block: &[u8]
) -> Result<Vec<u8>> {
    let (entries, central_directory, eocd) = split_sections(zip_buf, offsets);

    let new_cd_start = entries.len() + padding_before_block + signing_block.len();

    let mut final_apk: Vec<u8> =
        Vec::with_capacity(zip_buf.len() + padding_before_block + signing_block.len());
    final_apk.extend(entries);
    final_apk.extend(std::iter::repeat(0u8).take(padding_before_block));
    final_apk.extend(signing_block);
    final_apk.extend(central_directory);
    final_apk.extend(copy_with_modified_cd_offset(eocd, new_cd_start as u32));

    // Et voila
    Ok(final_apk)
}
