//! End-to-end signing of a minimal archive: v1 + v2 + v3 all enabled with
//! one RSA signer.

use std::io::Cursor;

use reseal_sign::algorithms::SignatureAlgorithm;
use reseal_sign::crypto::verify_data;
use reseal_sign::signing_block::{
    find_signing_block_pairs, parse_scheme_block_signers, SliceReader,
    ANDROID_COMMON_PAGE_ALIGNMENT, SIGNATURE_SCHEME_V2_BLOCK_ID, SIGNATURE_SCHEME_V3_BLOCK_ID
};
use reseal_sign::zip_parser::find_offsets;
use reseal_sign::{sign_apk_buffer, SignerConfig, SignerEngine};

fn make_unsigned_apk() -> Vec<u8> {
    let files = vec![
        reseal_zip::File {
            path: "classes.dex".to_string(),
            data: b"dex\n035\0not really dex code".to_vec()
        },
        reseal_zip::File {
            path: "resources.arsc".to_string(),
            data: vec![0x02, 0x00, 0x0c, 0x00, 1, 2, 3, 4]
        },
    ];
    let mut out = Cursor::new(Vec::new());
    reseal_zip::zip_apk(&files, &mut out).unwrap();
    out.into_inner()
}

fn test_signer() -> SignerConfig {
    SignerConfig::generate_random_testing_keys("release").unwrap()
}

#[test]
fn signs_with_all_three_schemes() {
    let apk = make_unsigned_apk();
    let signer = test_signer();
    let public_key = signer.public_key.clone();

    let mut engine = SignerEngine::builder(vec![signer], 24).build().unwrap();
    let signed = sign_apk_buffer(&apk, &mut engine).unwrap();
    engine.close();

    // Legacy scheme artifacts are present
    let entries = reseal_zip::read_entries(&signed).unwrap();
    let names: Vec<&str> = entries.iter().map(|f| f.path.as_str()).collect();
    assert!(names.contains(&"META-INF/MANIFEST.MF"));
    assert!(names.contains(&"META-INF/RELEASE.SF"));
    assert!(names.contains(&"META-INF/RELEASE.RSA"));
    assert!(names.contains(&"classes.dex"));

    // The signature file advertises the modern schemes
    let sf = entries.iter().find(|f| f.path == "META-INF/RELEASE.SF").unwrap();
    let sf_text = String::from_utf8_lossy(&sf.data);
    assert!(sf_text.contains("X-Android-APK-Signed: 2, 3"));

    // The signing block carries a v2 and a v3 block and everything before
    // the central directory is page aligned
    let offsets = find_offsets(&signed).unwrap();
    assert_eq!(offsets.cd_start % ANDROID_COMMON_PAGE_ALIGNMENT, 0);
    let pairs = find_signing_block_pairs(&signed, &offsets).unwrap();
    let ids: Vec<u32> = pairs.iter().map(|(id, _)| *id).collect();
    assert!(ids.contains(&SIGNATURE_SCHEME_V2_BLOCK_ID));
    assert!(ids.contains(&SIGNATURE_SCHEME_V3_BLOCK_ID));

    // Each generated signature must verify against the signed data bytes
    for block_id in [SIGNATURE_SCHEME_V2_BLOCK_ID, SIGNATURE_SCHEME_V3_BLOCK_ID] {
        let block = &pairs.iter().find(|(id, _)| *id == block_id).unwrap().1;
        let signers = parse_scheme_block_signers(block).unwrap();
        assert_eq!(signers.len(), 1);

        let mut signer_reader = SliceReader::new(&signers[0].raw);
        let signed_data = signer_reader.length_prefixed().unwrap();
        if block_id == SIGNATURE_SCHEME_V3_BLOCK_ID {
            // skip the min/max SDK fields to reach the signatures
            signer_reader.read_u32().unwrap();
            signer_reader.read_u32().unwrap();
        }
        let mut signatures = SliceReader::new(signer_reader.length_prefixed().unwrap());
        let mut verified_any = false;
        while signatures.remaining() > 0 {
            let mut record = SliceReader::new(signatures.length_prefixed().unwrap());
            let algorithm_id = record.read_u32().unwrap();
            let signature = record.length_prefixed().unwrap();
            let algorithm = SignatureAlgorithm::from_id(algorithm_id).unwrap();
            if verify_data(&public_key, algorithm, signed_data, signature).unwrap() {
                verified_any = true;
            }
        }
        assert!(verified_any, "no verifiable signature in block 0x{block_id:08x}");
    }
}

#[test]
fn two_runs_with_the_same_key_agree_on_layout() {
    let apk = make_unsigned_apk();
    let signer = test_signer();

    let mut first_engine = SignerEngine::builder(vec![signer.clone()], 24).build().unwrap();
    let first = sign_apk_buffer(&apk, &mut first_engine).unwrap();
    let mut second_engine = SignerEngine::builder(vec![signer], 24).build().unwrap();
    let second = sign_apk_buffer(&apk, &mut second_engine).unwrap();

    assert_eq!(first.len(), second.len());

    // The container footers (size fields and magic) match byte for byte
    let first_offsets = find_offsets(&first).unwrap();
    let second_offsets = find_offsets(&second).unwrap();
    assert_eq!(first_offsets.cd_start, second_offsets.cd_start);
    assert_eq!(
        &first[first_offsets.cd_start - 24..first_offsets.cd_start],
        &second[second_offsets.cd_start - 24..second_offsets.cd_start]
    );
}

#[test]
fn v1_only_signing_emits_no_signing_block() {
    let apk = make_unsigned_apk();
    let mut engine = SignerEngine::builder(vec![test_signer()], 24)
        .v2_signing_enabled(false)
        .v3_signing_enabled(false)
        .build()
        .unwrap();
    let signed = sign_apk_buffer(&apk, &mut engine).unwrap();

    let offsets = find_offsets(&signed).unwrap();
    assert!(find_signing_block_pairs(&signed, &offsets).is_err());
    let entries = reseal_zip::read_entries(&signed).unwrap();
    assert!(entries.iter().any(|f| f.path == "META-INF/MANIFEST.MF"));
}
