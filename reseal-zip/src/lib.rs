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
use std::io::{Cursor, Read, Seek, Write};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

pub struct File {
    pub path: String,
    pub data: Vec<u8>
}

const UNCOMPRESSED_FILES: &[&str] = &["resources.arsc"];

// Output can be a file *or* a buffer in memory
pub fn zip_apk<T: Write + Seek>(files: &[File], output: T) -> Result<()> {
    let mut zip = ZipWriter::new(output);
    let compressed_options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .with_alignment(4);
    // Some files in APKs are not allowed to be compressed
    let uncompressed_options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .with_alignment(4);

    for file in files {
        let options = if UNCOMPRESSED_FILES.contains(&&file.path[..]) {
            uncompressed_options
        } else {
            compressed_options
        };
        zip.start_file_from_path(&file.path, options)?;
        zip.write_all(&file.data)?;
    }

    zip.finish()?;
    Ok(())
}

/// Reads every entry of an existing zip back into memory, in the order the
/// archive stores them. Directory entries come back with empty data and a
/// trailing `/` in their path, the same way the writer would emit them.
pub fn read_entries(zip_buf: &[u8]) -> Result<Vec<File>> {
    let mut archive = ZipArchive::new(Cursor::new(zip_buf))?;
    let mut files = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        files.push(File {
            path: entry.name().to_string(),
            data
        });
    }
    Ok(files)
}
