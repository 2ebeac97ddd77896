//! v4 side artifact: digest extraction from the embedded blocks, the
//! Merkle root binding, and the on-disk format.

use std::io::{Cursor, Write};

use reseal_sign::v4_signing::{
    V4Signature, HASHING_ALGORITHM_SHA256, LOG2_BLOCK_SIZE_4096_BYTES, V4_FORMAT_VERSION
};
use reseal_sign::verity::{build_verity_tree, VERITY_BLOCK_SIZE};
use reseal_sign::{sign_apk_buffer, SignerConfig, SignerEngine};

fn signed_apk(engine: &mut SignerEngine) -> Vec<u8> {
    let files = vec![reseal_zip::File {
        path: "classes.dex".to_string(),
        data: vec![0x5au8; 10_000]
    }];
    let mut out = Cursor::new(Vec::new());
    reseal_zip::zip_apk(&files, &mut out).unwrap();
    sign_apk_buffer(&out.into_inner(), engine).unwrap()
}

fn read_u32(bytes: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap())
}

#[test]
fn v4_signature_binds_the_verity_root() {
    let signer = SignerConfig::generate_random_testing_keys("release").unwrap();
    let mut engine = SignerEngine::builder(vec![signer], 24).build().unwrap();
    let apk = signed_apk(&mut engine);

    let (signature, tree) = engine.sign_v4(&apk).unwrap().expect("v4 must succeed");

    // The tree matches an independently computed unsalted Merkle tree
    let expected = build_verity_tree(&[&apk], &[]);
    assert_eq!(tree, expected.tree);
    assert_eq!(tree.len() % VERITY_BLOCK_SIZE, 0);

    // Hashing info: SHA-256, 4096-byte blocks, empty salt, 32-byte root
    let hashing = &signature.hashing_info;
    assert_eq!(read_u32(hashing, 0), HASHING_ALGORITHM_SHA256);
    assert_eq!(hashing[4], LOG2_BLOCK_SIZE_4096_BYTES);
    assert_eq!(read_u32(hashing, 5), 0); // salt length
    assert_eq!(read_u32(hashing, 9), 32); // root hash length
    assert_eq!(&hashing[13..45], &expected.root_hash);

    // Serialized layout: version ‖ sized(hashing) ‖ sized(signing infos)
    let mut file = Vec::new();
    signature.write_to(&mut file).unwrap();
    V4Signature::write_tree(&mut file, &tree).unwrap();
    assert_eq!(read_u32(&file, 0), V4_FORMAT_VERSION);
    let hashing_len = read_u32(&file, 4) as usize;
    assert_eq!(&file[8..8 + hashing_len], &signature.hashing_info[..]);
    let infos_pos = 8 + hashing_len;
    let infos_len = read_u32(&file, infos_pos) as usize;
    let tree_pos = infos_pos + 4 + infos_len;
    assert_eq!(read_u32(&file, tree_pos) as usize, tree.len());
    assert_eq!(&file[tree_pos + 4..], &tree[..]);
}

#[test]
fn v4_over_an_unsigned_archive_respects_the_failure_policy() {
    let files = vec![reseal_zip::File {
        path: "a.txt".to_string(),
        data: b"not signed".to_vec()
    }];
    let mut out = Cursor::new(Vec::new());
    reseal_zip::zip_apk(&files, &mut out).unwrap();
    let unsigned = out.into_inner();

    let signer = SignerConfig::generate_random_testing_keys("release").unwrap();

    // Fatal by default: no v2/v3 block to extract a digest from
    let engine = SignerEngine::builder(vec![signer.clone()], 24).build().unwrap();
    assert!(engine.sign_v4(&unsigned).is_err());

    // Opted into ignoring failures: the artifact is simply omitted
    let engine = SignerEngine::builder(vec![signer], 24)
        .v4_signing_failures_fatal(false)
        .build()
        .unwrap();
    assert!(engine.sign_v4(&unsigned).unwrap().is_none());
}

#[test]
fn idsig_file_writes_through_any_writer() {
    let signer = SignerConfig::generate_random_testing_keys("release").unwrap();
    let mut engine = SignerEngine::builder(vec![signer], 24).build().unwrap();
    let apk = signed_apk(&mut engine);
    let (signature, tree) = engine.sign_v4(&apk).unwrap().unwrap();

    let file = tempfile::NamedTempFile::new().unwrap();
    {
        let mut writer = std::io::BufWriter::new(file.reopen().unwrap());
        signature.write_to(&mut writer).unwrap();
        V4Signature::write_tree(&mut writer, &tree).unwrap();
        writer.flush().unwrap();
    }
    let written = std::fs::read(file.path()).unwrap();
    assert_eq!(read_u32(&written, 0), V4_FORMAT_VERSION);
    assert!(written.len() > tree.len());
}
