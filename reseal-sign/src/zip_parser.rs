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

use byteorder::{LittleEndian, ReadBytesExt};
use reseal_common::*;
use std::io::Cursor;

/// Offsets of the three signable zip regions. The entries region runs from
/// the start of the file to `cd_start`.
#[derive(Default, Debug, Clone, Copy)]
pub struct ZipSections {
    // Central Directory (from start of file)
    pub cd_start: usize,
    // End of Central Directory (from start of file)
    pub eocd_start: usize
}

pub const EOCD_MAGIC: &[u8; 4] = &[0x50, 0x4B, 0x05, 0x06];

/// Byte offset of the central-directory-offset field inside the EOCD.
pub const EOCD_CD_OFFSET_FIELD: usize = 16;

pub fn find_offsets(zip_buf: &[u8]) -> Result<ZipSections> {
    if zip_buf.len() < 22 {
        return Err(ResealError::ZipSectionsNotFound);
    }
    let mut offsets = ZipSections::default();
    let mut found = false;
    // The EOCD may be followed by a comment, so scan backwards for the
    // magic rather than assuming it sits at the very end.
    for i in (0..=(zip_buf.len() - 4)).rev() {
        let magic = &zip_buf[i..(i + 4)];
        if magic == EOCD_MAGIC {
            // Found the end of central directory!
            offsets.eocd_start = i;

            // The EOCD also tells us where the central directories start
            let mut eocd_cd_start_field =
                Cursor::new(&zip_buf[(i + EOCD_CD_OFFSET_FIELD)..(i + EOCD_CD_OFFSET_FIELD + 4)]);
            let cd_start = eocd_cd_start_field.read_u32::<LittleEndian>()?;
            offsets.cd_start = cd_start as usize;
            found = true;
            break;
        }
    }

    if !found || offsets.cd_start == 0 || offsets.cd_start > offsets.eocd_start {
        // Couldn't find a usable central directory
        return Err(ResealError::ZipSectionsNotFound);
    }
    Ok(offsets)
}

/// Borrows the three regions out of the archive buffer.
pub fn split_sections<'a>(
    zip_buf: &'a [u8],
    offsets: &ZipSections
) -> (&'a [u8], &'a [u8], &'a [u8]) {
    (
        &zip_buf[..offsets.cd_start],
        &zip_buf[offsets.cd_start..offsets.eocd_start],
        &zip_buf[offsets.eocd_start..]
    )
}

/// Returns a copy of the EOCD with its central-directory-offset field
/// patched, so digests and the final archive both see offsets that account
/// for inserted bytes.
pub fn copy_with_modified_cd_offset(eocd: &[u8], new_cd_start: u32) -> Vec<u8> {
    let mut patched = eocd.to_vec();
    patched[EOCD_CD_OFFSET_FIELD..EOCD_CD_OFFSET_FIELD + 4]
        .copy_from_slice(&new_cd_start.to_le_bytes());
    patched
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eocd_patch_only_touches_the_offset_field() {
        let mut eocd = vec![0u8; 22];
        eocd[..4].copy_from_slice(EOCD_MAGIC);
        let patched = copy_with_modified_cd_offset(&eocd, 0xAABBCCDD);
        assert_eq!(&patched[..16], &eocd[..16]);
        assert_eq!(&patched[16..20], &0xAABBCCDDu32.to_le_bytes());
        assert_eq!(&patched[20..], &eocd[20..]);
    }
}
