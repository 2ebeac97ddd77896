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

//! Just enough binary-XML parsing to answer one question: does this
//! AndroidManifest.xml declare `android:debuggable="true"` on its
//! `application` element?
//!
//! The chunk walk covers the string pool, the resource map and start
//! elements; everything else is skipped by chunk size.

use reseal_common::*;

pub const ANDROID_MANIFEST_ENTRY_NAME: &str = "AndroidManifest.xml";

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;

const UTF8_FLAG: u32 = 1 << 8;

/// Resource id of the android:debuggable attribute.
const DEBUGGABLE_RESOURCE_ID: u32 = 0x0101_000F;

const TYPE_REFERENCE: u8 = 0x01;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const TYPE_INT_BOOLEAN: u8 = 0x12;

/// Scans a compiled AndroidManifest.xml for the debuggable declaration.
///
/// A debuggable attribute whose value is a resource reference cannot be
/// resolved here (it depends on resource configuration), so it is reported
/// as malformed rather than guessed at.
pub fn is_debuggable(manifest: &[u8]) -> Result<bool> {
    let (outer_type, _header, outer_size) = chunk_header(manifest, 0)?;
    if outer_type != RES_XML_TYPE || outer_size > manifest.len() {
        return Err(ResealError::MalformedAndroidManifest(
            "not a binary XML document".into()
        ));
    }

    let mut strings: Vec<String> = vec![];
    let mut resource_map: Vec<u32> = vec![];

    let mut pos = 8;
    while pos + 8 <= outer_size {
        let (chunk_type, header_size, chunk_size) = chunk_header(manifest, pos)?;
        if chunk_size < 8 || pos + chunk_size > outer_size {
            return Err(ResealError::MalformedAndroidManifest(format!(
                "chunk at {pos} overruns the document"
            )));
        }
        let chunk = &manifest[pos..pos + chunk_size];
        match chunk_type {
            RES_STRING_POOL_TYPE => strings = parse_string_pool(chunk)?,
            RES_XML_RESOURCE_MAP_TYPE => {
                resource_map = chunk[header_size..]
                    .chunks_exact(4)
                    .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                    .collect();
            }
            RES_XML_START_ELEMENT_TYPE => {
                if let Some(value) =
                    debuggable_of_element(chunk, header_size, &strings, &resource_map)?
                {
                    return Ok(value);
                }
            }
            _ => {}
        }
        pos += chunk_size;
    }

    Ok(false)
}

fn chunk_header(buf: &[u8], pos: usize) -> Result<(u16, usize, usize)> {
    if pos + 8 > buf.len() {
        return Err(ResealError::MalformedAndroidManifest(
            "truncated chunk header".into()
        ));
    }
    let chunk_type = u16::from_le_bytes(buf[pos..pos + 2].try_into().unwrap());
    let header_size = u16::from_le_bytes(buf[pos + 2..pos + 4].try_into().unwrap()) as usize;
    let chunk_size = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap()) as usize;
    Ok((chunk_type, header_size, chunk_size))
}

/// Checks one start-element chunk; `Ok(Some(_))` once the application
/// element's debuggable attribute has been found.
fn debuggable_of_element(
    chunk: &[u8],
    header_size: usize,
    strings: &[String],
    resource_map: &[u32]
) -> Result<Option<bool>> {
    // header ‖ line ‖ comment ‖ ns ‖ name ‖ attrStart ‖ attrSize ‖ attrCount
    let ext = header_size;
    if chunk.len() < ext + 20 {
        return Err(ResealError::MalformedAndroidManifest(
            "truncated element chunk".into()
        ));
    }
    let name_idx = u32::from_le_bytes(chunk[ext + 4..ext + 8].try_into().unwrap()) as usize;
    if strings.get(name_idx).map(|s| s.as_str()) != Some("application") {
        return Ok(None);
    }

    let attr_start = u16::from_le_bytes(chunk[ext + 8..ext + 10].try_into().unwrap()) as usize;
    let attr_size = u16::from_le_bytes(chunk[ext + 10..ext + 12].try_into().unwrap()) as usize;
    let attr_count = u16::from_le_bytes(chunk[ext + 12..ext + 14].try_into().unwrap()) as usize;

    for i in 0..attr_count {
        let at = ext + attr_start + i * attr_size;
        if chunk.len() < at + 20 {
            return Err(ResealError::MalformedAndroidManifest(
                "truncated attribute record".into()
            ));
        }
        let attr_name_idx =
            u32::from_le_bytes(chunk[at + 4..at + 8].try_into().unwrap()) as usize;
        let by_resource_id =
            resource_map.get(attr_name_idx) == Some(&DEBUGGABLE_RESOURCE_ID);
        let by_name =
            strings.get(attr_name_idx).map(|s| s.as_str()) == Some("debuggable");
        if !by_resource_id && !by_name {
            continue;
        }

        let data_type = chunk[at + 15];
        let data = u32::from_le_bytes(chunk[at + 16..at + 20].try_into().unwrap());
        return match data_type {
            TYPE_INT_BOOLEAN | TYPE_INT_DEC | TYPE_INT_HEX => Ok(Some(data != 0)),
            TYPE_REFERENCE => Err(ResealError::MalformedAndroidManifest(
                "android:debuggable uses a resource reference; its value cannot be \
                 determined at signing time"
                    .into()
            )),
            other => Err(ResealError::MalformedAndroidManifest(format!(
                "unexpected android:debuggable value type 0x{other:02x}"
            )))
        };
    }

    // An application element without the attribute means not debuggable
    Ok(Some(false))
}

fn parse_string_pool(chunk: &[u8]) -> Result<Vec<String>> {
    if chunk.len() < 28 {
        return Err(ResealError::MalformedAndroidManifest(
            "truncated string pool".into()
        ));
    }
    let string_count = u32::from_le_bytes(chunk[8..12].try_into().unwrap()) as usize;
    let flags = u32::from_le_bytes(chunk[16..20].try_into().unwrap());
    let strings_start = u32::from_le_bytes(chunk[20..24].try_into().unwrap()) as usize;
    let utf8 = flags & UTF8_FLAG != 0;

    let mut strings = Vec::with_capacity(string_count);
    for i in 0..string_count {
        let off_pos = 28 + i * 4;
        if chunk.len() < off_pos + 4 {
            return Err(ResealError::MalformedAndroidManifest(
                "string pool offset table truncated".into()
            ));
        }
        let offset =
            u32::from_le_bytes(chunk[off_pos..off_pos + 4].try_into().unwrap()) as usize;
        strings.push(read_pool_string(chunk, strings_start + offset, utf8)?);
    }
    Ok(strings)
}

fn read_pool_string(chunk: &[u8], mut pos: usize, utf8: bool) -> Result<String> {
    let truncated =
        || ResealError::MalformedAndroidManifest("string data out of bounds".into());
    if utf8 {
        // Two varlengths: UTF-16 length (ignored) then byte length
        let (_, advance) = read_utf8_len(chunk, pos).ok_or_else(truncated)?;
        pos += advance;
        let (byte_len, advance) = read_utf8_len(chunk, pos).ok_or_else(truncated)?;
        pos += advance;
        let bytes = chunk.get(pos..pos + byte_len).ok_or_else(truncated)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    } else {
        let (char_len, advance) = read_utf16_len(chunk, pos).ok_or_else(truncated)?;
        pos += advance;
        let bytes = chunk.get(pos..pos + char_len * 2).ok_or_else(truncated)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }
}

fn read_utf8_len(chunk: &[u8], pos: usize) -> Option<(usize, usize)> {
    let first = *chunk.get(pos)? as usize;
    if first & 0x80 != 0 {
        let second = *chunk.get(pos + 1)? as usize;
        Some((((first & 0x7f) << 8) | second, 2))
    } else {
        Some((first, 1))
    }
}

fn read_utf16_len(chunk: &[u8], pos: usize) -> Option<(usize, usize)> {
    let first = u16::from_le_bytes(chunk.get(pos..pos + 2)?.try_into().unwrap()) as usize;
    if first & 0x8000 != 0 {
        let second =
            u16::from_le_bytes(chunk.get(pos + 2..pos + 4)?.try_into().unwrap()) as usize;
        Some((((first & 0x7fff) << 16) | second, 4))
    } else {
        Some((first, 2))
    }
}
