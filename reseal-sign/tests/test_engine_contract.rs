//! Orchestrator contract: outstanding requests block finalization,
//! requests can't be answered out of thin air, and the debuggable policy
//! inspects the binary manifest before any signature is emitted.

use reseal_common::ResealError;
use reseal_sign::{SignerConfig, SignerEngine};

fn test_engine(debuggable_permitted: bool) -> SignerEngine {
    let signer = SignerConfig::generate_random_testing_keys("release").unwrap();
    SignerEngine::builder(vec![signer], 24)
        .debuggable_apk_permitted(debuggable_permitted)
        .build()
        .unwrap()
}

/// Builds a minimal binary AndroidManifest.xml whose `application`
/// element carries a literal `debuggable` attribute.
fn binary_manifest(debuggable: bool) -> Vec<u8> {
    fn utf8_string(s: &str) -> Vec<u8> {
        let mut out = vec![s.len() as u8, s.len() as u8];
        out.extend_from_slice(s.as_bytes());
        out.push(0);
        out
    }

    // String pool: ["debuggable", "application"], UTF-8
    let strings = [utf8_string("debuggable"), utf8_string("application")];
    let mut pool_body = Vec::new();
    pool_body.extend_from_slice(&2u32.to_le_bytes()); // string count
    pool_body.extend_from_slice(&0u32.to_le_bytes()); // style count
    pool_body.extend_from_slice(&(1u32 << 8).to_le_bytes()); // UTF-8 flag
    let strings_start = 28 + 8; // header + 2 offsets
    pool_body.extend_from_slice(&(strings_start as u32).to_le_bytes());
    pool_body.extend_from_slice(&0u32.to_le_bytes()); // styles start
    pool_body.extend_from_slice(&0u32.to_le_bytes()); // offset of string 0
    pool_body.extend_from_slice(&(strings[0].len() as u32).to_le_bytes());
    for s in &strings {
        pool_body.extend_from_slice(s);
    }
    let mut pool = Vec::new();
    pool.extend_from_slice(&0x0001u16.to_le_bytes());
    pool.extend_from_slice(&28u16.to_le_bytes());
    pool.extend_from_slice(&((8 + pool_body.len()) as u32).to_le_bytes());
    pool.extend_from_slice(&pool_body);

    // Start element "application" with one attribute "debuggable"
    let mut element = Vec::new();
    element.extend_from_slice(&0x0102u16.to_le_bytes());
    element.extend_from_slice(&16u16.to_le_bytes());
    element.extend_from_slice(&56u32.to_le_bytes());
    element.extend_from_slice(&0u32.to_le_bytes()); // line number
    element.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // comment
    element.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // element ns
    element.extend_from_slice(&1u32.to_le_bytes()); // name = "application"
    element.extend_from_slice(&20u16.to_le_bytes()); // attribute start
    element.extend_from_slice(&20u16.to_le_bytes()); // attribute size
    element.extend_from_slice(&1u16.to_le_bytes()); // attribute count
    element.extend_from_slice(&[0u8; 6]); // id/class/style indexes
    element.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // attr ns
    element.extend_from_slice(&0u32.to_le_bytes()); // attr name = "debuggable"
    element.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // raw value
    element.extend_from_slice(&8u16.to_le_bytes()); // typed value size
    element.push(0); // res0
    element.push(0x12); // TYPE_INT_BOOLEAN
    element.extend_from_slice(&(if debuggable { 0xffff_ffffu32 } else { 0 }).to_le_bytes());

    let mut doc = Vec::new();
    doc.extend_from_slice(&0x0003u16.to_le_bytes());
    doc.extend_from_slice(&8u16.to_le_bytes());
    doc.extend_from_slice(&((8 + pool.len() + element.len()) as u32).to_le_bytes());
    doc.extend_from_slice(&pool);
    doc.extend_from_slice(&element);
    doc
}

#[test]
fn finalize_with_an_outstanding_request_is_a_contract_violation() {
    let mut engine = test_engine(true);
    let _request = engine.output_entry("classes.dex").unwrap();
    // The request was never fulfilled
    match engine.finalize_entries() {
        Err(ResealError::ContractViolation(_)) => {}
        other => panic!("expected a contract violation, got {other:?}")
    }
}

#[test]
fn fulfilling_without_a_request_is_a_contract_violation() {
    let mut engine = test_engine(true);
    let request = engine.output_entry("classes.dex").unwrap();
    engine.fulfill_entry(request, b"dex").unwrap();
    // A second request for the same entry works; reusing is impossible
    // because fulfilment consumed the token. Fabricate the double-fulfil
    // by asking again and answering twice through a fresh token.
    let request = engine.output_entry("classes.dex").unwrap();
    engine.fulfill_entry(request, b"dex").unwrap();
    let request = engine.output_entry("other.bin").unwrap();
    engine.fulfill_entry(request, b"x").unwrap();
    // No outstanding request for an entry never announced
    let stray = engine.output_entry("late.bin").unwrap();
    engine.output_entry_removed("late.bin");
    match engine.fulfill_entry(stray, b"y") {
        Err(ResealError::ContractViolation(_)) => {}
        other => panic!("expected a contract violation, got {other:?}")
    }
}

#[test]
fn skipping_finalize_entries_is_caught_at_section_time() {
    let mut engine = test_engine(true);
    let request = engine.output_entry("classes.dex").unwrap();
    engine.fulfill_entry(request, b"dex").unwrap();
    // Straight to the zip sections without the v1 phase
    match engine.finalize_zip_sections(b"entries", b"cd", &[0u8; 22]) {
        Err(ResealError::ContractViolation(_)) => {}
        other => panic!("expected a contract violation, got {other:?}")
    }
}

#[test]
fn debuggable_archives_are_rejected_when_policy_forbids_them() {
    let mut engine = test_engine(false);
    let request = engine.output_entry("AndroidManifest.xml").unwrap();
    engine.fulfill_entry(request, &binary_manifest(true)).unwrap();
    match engine.finalize_entries() {
        Err(ResealError::DebuggableApkRejected(entry)) => {
            assert_eq!(entry, "AndroidManifest.xml");
        }
        other => panic!("expected a debuggable rejection, got {other:?}")
    }
}

#[test]
fn non_debuggable_archives_pass_the_policy() {
    let mut engine = test_engine(false);
    let request = engine.output_entry("AndroidManifest.xml").unwrap();
    engine.fulfill_entry(request, &binary_manifest(false)).unwrap();
    assert!(engine.finalize_entries().unwrap().is_some());
}

#[test]
fn debuggable_status_must_be_determinable_before_finalizing() {
    let mut engine = test_engine(false);
    let request = engine.output_entry("classes.dex").unwrap();
    engine.fulfill_entry(request, b"dex").unwrap();
    // AndroidManifest.xml was never output, so the status is unknowable
    match engine.finalize_entries() {
        Err(ResealError::ContractViolation(_)) => {}
        other => panic!("expected a contract violation, got {other:?}")
    }
}
