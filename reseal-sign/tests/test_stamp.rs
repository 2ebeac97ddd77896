//! Source stamp: the stamp block joins the container, the stamp
//! certificate digest enters the v1 manifest, and the lenient verifier
//! accepts what the signer produced.

use std::io::Cursor;

use reseal_sign::signing_block::find_signing_block_pairs;
use reseal_sign::stamp::{verify_source_stamp, SchemeDigestInfos};
use reseal_sign::v1_signing::parse_manifest;
use reseal_sign::zip_parser::find_offsets;
use reseal_sign::{sign_apk_buffer, SignerConfig, SignerEngine, V2_SOURCE_STAMP_BLOCK_ID};

#[test]
fn stamp_block_joins_the_container_and_the_manifest() {
    let signer = SignerConfig::generate_random_testing_keys("release").unwrap();
    let stamp_signer = SignerConfig::generate_random_testing_keys("stamp").unwrap();
    let stamp_public_key = stamp_signer.public_key.clone();
    let stamp_certificate = stamp_signer.signing_certificate().to_vec();

    let files = vec![reseal_zip::File {
        path: "classes.dex".to_string(),
        data: b"dex".to_vec()
    }];
    let mut out = Cursor::new(Vec::new());
    reseal_zip::zip_apk(&files, &mut out).unwrap();

    let mut engine = SignerEngine::builder(vec![signer], 24)
        .source_stamp_signer_config(stamp_signer)
        .build()
        .unwrap();
    let signed = sign_apk_buffer(&out.into_inner(), &mut engine).unwrap();

    // The stamp certificate digest entry is covered by the v1 manifest
    let entries = reseal_zip::read_entries(&signed).unwrap();
    let manifest = entries
        .iter()
        .find(|f| f.path == "META-INF/MANIFEST.MF")
        .unwrap();
    let parsed = parse_manifest(&manifest.data);
    assert!(parsed
        .entry_attributes
        .iter()
        .any(|(name, _)| name == "stamp-cert-sha256"));

    // The stamp block is in the container and verifies under the stamp key
    let offsets = find_offsets(&signed).unwrap();
    let pairs = find_signing_block_pairs(&signed, &offsets).unwrap();
    let stamp_block = &pairs
        .iter()
        .find(|(id, _)| *id == V2_SOURCE_STAMP_BLOCK_ID)
        .expect("stamp block present")
        .1;

    let expected_certificate_digest =
        reseal_sign::stamp::source_stamp_certificate_digest(&stamp_certificate);
    let result = verify_source_stamp(
        stamp_block,
        &expected_certificate_digest,
        &SchemeDigestInfos::new(),
        &stamp_public_key
    );
    assert!(result.errors.is_empty(), "stamp errors: {:?}", result.errors);
    assert!(result.verified);
}

#[test]
fn stamp_without_any_scheme_is_inert() {
    let signer = SignerConfig::generate_random_testing_keys("release").unwrap();
    let stamp_signer = SignerConfig::generate_random_testing_keys("stamp").unwrap();
    let engine = SignerEngine::builder(vec![signer], 24)
        .v1_signing_enabled(false)
        .v2_signing_enabled(false)
        .v3_signing_enabled(false)
        .source_stamp_signer_config(stamp_signer)
        .build()
        .unwrap();
    assert!(!engine.is_eligible_for_source_stamp());
}
