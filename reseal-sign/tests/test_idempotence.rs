//! Re-signing an unchanged archive is a no-op: `finalize_entries` reports
//! nothing to do and `finalize_zip_sections` returns byte-identical output.

use std::io::Cursor;

use reseal_sign::zip_parser::{find_offsets, split_sections};
use reseal_sign::{SignerConfig, SignerEngine};

fn entry(name: &str, data: &[u8]) -> reseal_zip::File {
    reseal_zip::File {
        path: name.to_string(),
        data: data.to_vec()
    }
}

#[test]
fn unchanged_archive_is_a_no_op_on_the_second_pass() {
    let signer = SignerConfig::generate_random_testing_keys("release").unwrap();
    let mut engine = SignerEngine::builder(vec![signer], 24).build().unwrap();

    let mut files = vec![
        entry("classes.dex", b"dex bytes"),
        entry("assets/data.bin", &[9u8; 100]),
    ];

    for file in &files {
        let request = engine.output_entry(&file.path).unwrap();
        engine.fulfill_entry(request, &file.data).unwrap();
    }

    let signature_entries = engine
        .finalize_entries()
        .unwrap()
        .expect("first pass must emit the v1 signature");
    for jar_entry in &signature_entries {
        if let Some(request) = engine.output_entry(&jar_entry.name) {
            engine.fulfill_entry(request, &jar_entry.data).unwrap();
        }
        files.push(entry(&jar_entry.name, &jar_entry.data));
    }

    let mut zipped = Cursor::new(Vec::new());
    reseal_zip::zip_apk(&files, &mut zipped).unwrap();
    let zipped = zipped.into_inner();
    let offsets = find_offsets(&zipped).unwrap();
    let (entries, central_directory, eocd) = split_sections(&zipped, &offsets);

    let first_block = engine
        .finalize_zip_sections(entries, central_directory, eocd)
        .unwrap()
        .expect("v2/v3 enabled, so a signing block must be produced");

    // Second pass without touching any entry
    assert!(engine.finalize_entries().unwrap().is_none());
    let second_block = engine
        .finalize_zip_sections(entries, central_directory, eocd)
        .unwrap()
        .unwrap();
    assert_eq!(first_block, second_block);

    engine.output_done().unwrap();
    engine.close();
}

#[test]
fn touching_an_entry_invalidates_the_cached_block() {
    let signer = SignerConfig::generate_random_testing_keys("release").unwrap();
    let mut engine = SignerEngine::builder(vec![signer], 24)
        .v1_signing_enabled(false)
        .build()
        .unwrap();

    let files = vec![entry("classes.dex", b"original")];
    for file in &files {
        assert!(engine.output_entry(&file.path).is_none());
    }

    let mut zipped = Cursor::new(Vec::new());
    reseal_zip::zip_apk(&files, &mut zipped).unwrap();
    let zipped = zipped.into_inner();
    let offsets = find_offsets(&zipped).unwrap();
    let (entries, central_directory, eocd) = split_sections(&zipped, &offsets);
    let first = engine
        .finalize_zip_sections(entries, central_directory, eocd)
        .unwrap()
        .unwrap();

    // Mutate the entry, rebuild, and expect a different signing block
    let files = vec![entry("classes.dex", b"modified")];
    assert!(engine.output_entry("classes.dex").is_none());
    let mut zipped = Cursor::new(Vec::new());
    reseal_zip::zip_apk(&files, &mut zipped).unwrap();
    let zipped = zipped.into_inner();
    let offsets = find_offsets(&zipped).unwrap();
    let (entries, central_directory, eocd) = split_sections(&zipped, &offsets);
    let second = engine
        .finalize_zip_sections(entries, central_directory, eocd)
        .unwrap()
        .unwrap();

    assert_ne!(first.signing_block, second.signing_block);
}
