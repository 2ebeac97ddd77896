//! Certificate lineage: window partitioning must cover every platform
//! version from the floor upwards with no gaps and no overlaps, rotation
//! splits into the v3.1 list, and the dev-release boundary overlaps by
//! exactly one version.

use proptest::prelude::*;
use rsa::{RsaPrivateKey, RsaPublicKey};

use reseal_sign::algorithms::{sdk, SignatureAlgorithm};
use reseal_sign::crypto_keys::SchemeSignerConfig;
use reseal_sign::lineage::{
    resolve_scheme_windows, split_v31_configs, LineageNode, SigningCertificateLineage,
    DEFAULT_CAPABILITIES
};

fn shared_key() -> RsaPrivateKey {
    use rand::SeedableRng;
    use std::sync::OnceLock;
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        RsaPrivateKey::new(&mut rng, 512).unwrap()
    })
    .clone()
}

fn config(certificate: Vec<u8>, algorithms: Vec<SignatureAlgorithm>) -> SchemeSignerConfig {
    let key = shared_key();
    SchemeSignerConfig {
        certificates: vec![certificate],
        public_key: RsaPublicKey::from(&key),
        private_key: key,
        algorithms,
        min_sdk_version: 0,
        max_sdk_version: 0,
        lineage: None
    }
}

fn lineage_of(certificates: &[Vec<u8>]) -> SigningCertificateLineage {
    SigningCertificateLineage {
        nodes: certificates
            .iter()
            .map(|certificate| LineageNode {
                signing_certificate: certificate.clone(),
                parent_signature_algorithm_id: 0,
                signature_algorithm_id: SignatureAlgorithm::RsaPkcs1V15WithSha256.id(),
                signature: vec![],
                flags: DEFAULT_CAPABILITIES
            })
            .collect()
    }
}

proptest! {
    #[test]
    fn windows_partition_the_sdk_range(
        signer_count in 1usize..5,
        min_sdk in 21u32..35,
        algorithm_picks in proptest::collection::vec(0u8..3, 1..5)
    ) {
        let algorithm_sets: Vec<Vec<SignatureAlgorithm>> = (0..signer_count)
            .map(|i| match algorithm_picks[i % algorithm_picks.len()] {
                0 => vec![SignatureAlgorithm::RsaPkcs1V15WithSha256],
                1 => vec![SignatureAlgorithm::RsaPkcs1V15WithSha512],
                _ => vec![
                    SignatureAlgorithm::RsaPkcs1V15WithSha256,
                    SignatureAlgorithm::VerityRsaPkcs1V15WithSha256
                ]
            })
            .collect();
        let configs: Vec<SchemeSignerConfig> = algorithm_sets
            .iter()
            .enumerate()
            .map(|(i, algorithms)| config(vec![i as u8; 4], algorithms.clone()))
            .collect();

        match resolve_scheme_windows(configs, min_sdk, sdk::T, false, None) {
            Err(_) => {
                // A reported configuration error is an acceptable outcome;
                // silence or partial coverage is not
            }
            Ok(resolved) => {
                // Newest first: the first window must run to infinity
                prop_assert_eq!(resolved[0].max_sdk_version, sdk::MAX);
                // Consecutive windows must touch with no gap and no overlap
                for pair in resolved.windows(2) {
                    prop_assert_eq!(pair[1].max_sdk_version, pair[0].min_sdk_version - 1);
                }
                // Coverage must reach the floor (the scheme's own floor is
                // P, so floors below that are satisfied at P)
                let oldest_min = resolved.last().unwrap().min_sdk_version;
                prop_assert!(oldest_min <= min_sdk.max(sdk::P));
            }
        }
    }
}

#[test]
fn missing_floor_coverage_is_a_configuration_error() {
    // A verity-only signer cannot cover anything below P, and with an
    // engine floor above P demanding more than the signer offers the
    // resolution must fail loudly. Use an empty algorithm list to model a
    // signer with no usable algorithm at all.
    let configs = vec![
        config(vec![1; 4], vec![]),
        config(vec![2; 4], vec![SignatureAlgorithm::RsaPkcs1V15WithSha256]),
    ];
    // The newest signer covers everything, so resolution stops before the
    // broken signer is consulted
    assert!(resolve_scheme_windows(configs, 24, sdk::T, false, None).is_ok());

    let configs = vec![config(vec![1; 4], vec![])];
    assert!(resolve_scheme_windows(configs, 24, sdk::T, false, None).is_err());
}

#[test]
fn rotation_splits_into_a_v31_list() {
    let old_cert = vec![1u8; 4];
    let new_cert = vec![2u8; 4];
    let lineage = lineage_of(&[old_cert.clone(), new_cert.clone()]);
    let configs = vec![
        config(old_cert, vec![SignatureAlgorithm::RsaPkcs1V15WithSha256]),
        config(new_cert, vec![SignatureAlgorithm::RsaPkcs1V15WithSha256]),
    ];

    let mut resolved =
        resolve_scheme_windows(configs, 24, sdk::T, false, Some(&lineage)).unwrap();
    let v31 = split_v31_configs(&mut resolved, sdk::T);

    // The rotated signer moves to the v3.1 list with its sub-lineage
    assert_eq!(v31.len(), 1);
    assert_eq!(v31[0].min_sdk_version, sdk::T);
    assert_eq!(v31[0].max_sdk_version, sdk::MAX);
    assert_eq!(v31[0].lineage.as_ref().unwrap().size(), 2);

    // The old signer stays in the v3.0 list just below the boundary
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].max_sdk_version, sdk::T - 1);
    assert!(resolved[0].lineage.is_none());
}

#[test]
fn dev_release_boundary_overlaps_by_one_version() {
    let old_cert = vec![1u8; 4];
    let new_cert = vec![2u8; 4];
    let lineage = lineage_of(&[old_cert.clone(), new_cert.clone()]);

    let make_configs = || {
        vec![
            config(old_cert.clone(), vec![SignatureAlgorithm::RsaPkcs1V15WithSha256]),
            config(new_cert.clone(), vec![SignatureAlgorithm::RsaPkcs1V15WithSha256]),
        ]
    };

    let released =
        resolve_scheme_windows(make_configs(), 24, sdk::T, false, Some(&lineage)).unwrap();
    let old_signer = released.last().unwrap();
    assert_eq!(old_signer.max_sdk_version, sdk::T - 1);

    let dev_release =
        resolve_scheme_windows(make_configs(), 24, sdk::T, true, Some(&lineage)).unwrap();
    let old_signer = dev_release.last().unwrap();
    // The named special case: the pre-release platform shares its SDK
    // number with the newest shipped release, so the windows overlap there
    assert_eq!(old_signer.max_sdk_version, sdk::T);
}

#[test]
fn sub_lineage_truncates_at_the_certificate() {
    let lineage = lineage_of(&[vec![1; 4], vec![2; 4], vec![3; 4]]);
    assert_eq!(lineage.sub_lineage(&[2; 4]).unwrap().size(), 2);
    assert_eq!(lineage.sub_lineage(&[3; 4]).unwrap().size(), 3);
    assert!(lineage.sub_lineage(&[9; 4]).is_err());
}

#[test]
fn lineage_encoding_round_trips() {
    let lineage = lineage_of(&[vec![1; 4], vec![2; 4]]);
    let encoded = lineage.encode();
    let decoded = SigningCertificateLineage::decode(&encoded).unwrap();
    assert_eq!(lineage, decoded);
}
