//! v1 round-trip and minimal-churn behavior: changing one entry changes
//! exactly that entry's manifest section, and only missing or stale
//! signature files get re-emitted.

use std::collections::BTreeMap;

use reseal_sign::v1_signing::{
    generate_manifest_file, parse_manifest, V1DigestAlgorithm
};
use reseal_sign::{SignerConfig, SignerEngine};

#[test]
fn changing_one_entry_touches_one_manifest_section() {
    let mut digests: BTreeMap<String, Vec<u8>> = [
        ("classes.dex".to_string(), vec![1u8; 32]),
        ("lib/arm64-v8a/libapp.so".to_string(), vec![2u8; 32]),
        ("resources.arsc".to_string(), vec![3u8; 32])
    ]
    .into();
    let before =
        generate_manifest_file(V1DigestAlgorithm::Sha256, &digests, None, "1.0 (Android)");

    digests.insert("resources.arsc".to_string(), vec![9u8; 32]);
    let after =
        generate_manifest_file(V1DigestAlgorithm::Sha256, &digests, None, "1.0 (Android)");

    assert_eq!(before.main_section, after.main_section);
    let changed: Vec<&str> = before
        .individual_sections
        .iter()
        .zip(&after.individual_sections)
        .filter(|(a, b)| a.1 != b.1)
        .map(|(a, _)| a.0.as_str())
        .collect();
    assert_eq!(changed, vec!["resources.arsc"]);

    // Re-deriving from the same digests is byte-identical
    let again =
        generate_manifest_file(V1DigestAlgorithm::Sha256, &digests, None, "1.0 (Android)");
    assert_eq!(after.contents, again.contents);
}

#[test]
fn only_missing_signature_files_are_re_emitted() {
    let signer_a = SignerConfig::generate_random_testing_keys("alpha").unwrap();
    let signer_b = SignerConfig::generate_random_testing_keys("beta").unwrap();
    // Two independent v1 signers require v3 to be off
    let mut engine = SignerEngine::builder(vec![signer_a, signer_b], 24)
        .v3_signing_enabled(false)
        .build()
        .unwrap();

    let request = engine.output_entry("classes.dex").unwrap();
    engine.fulfill_entry(request, b"dex").unwrap();

    let emitted = engine.finalize_entries().unwrap().unwrap();
    let names: Vec<&str> = emitted.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"META-INF/MANIFEST.MF"));
    assert!(names.contains(&"META-INF/ALPHA.SF"));
    assert!(names.contains(&"META-INF/ALPHA.RSA"));
    assert!(names.contains(&"META-INF/BETA.SF"));
    assert!(names.contains(&"META-INF/BETA.RSA"));

    // Write back everything except one signer's signature file
    for entry in &emitted {
        if entry.name == "META-INF/BETA.SF" {
            continue;
        }
        if let Some(request) = engine.output_entry(&entry.name) {
            engine.fulfill_entry(request, &entry.data).unwrap();
        }
    }

    let re_emitted = engine.finalize_entries().unwrap().unwrap();
    let names: Vec<&str> = re_emitted.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["META-INF/BETA.SF"]);
    // The other signer's files were untouched, and after writing the
    // missing one, nothing remains to do
    for entry in &re_emitted {
        if let Some(request) = engine.output_entry(&entry.name) {
            engine.fulfill_entry(request, &entry.data).unwrap();
        }
    }
    assert!(engine.finalize_entries().unwrap().is_none());
}

#[test]
fn main_attributes_are_borrowed_from_the_input_manifest() {
    let input = b"Manifest-Version: 1.0\r\nBuilt-By: somebody\r\nCreated-By: 9.9 (custom)\r\n\r\n";
    let digests: BTreeMap<String, Vec<u8>> =
        [("classes.dex".to_string(), vec![1u8; 32])].into();
    let manifest =
        generate_manifest_file(V1DigestAlgorithm::Sha256, &digests, Some(input), "1.0 (Android)");
    let parsed = parse_manifest(&manifest.contents);
    assert!(parsed
        .main_attributes
        .iter()
        .any(|(k, v)| k == "Built-By" && v == "somebody"));
    assert!(parsed
        .main_attributes
        .iter()
        .any(|(k, v)| k == "Created-By" && v == "9.9 (custom)"));
}
