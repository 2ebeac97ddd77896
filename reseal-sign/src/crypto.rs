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
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};

use crate::algorithms::SignatureAlgorithm;
use crate::crypto_keys::SchemeSignerConfig;

/// Signs `data` with the given algorithm. Only the RSA PKCS#1 v1.5 family
/// is supported for actual signing; the other IDs exist in the table for
/// wire compatibility and report their key algorithm as unsupported.
pub fn sign_data(
    private_key: &RsaPrivateKey,
    algorithm: SignatureAlgorithm,
    data: &[u8]
) -> Result<Vec<u8>> {
    match algorithm {
        SignatureAlgorithm::RsaPkcs1V15WithSha256
        | SignatureAlgorithm::VerityRsaPkcs1V15WithSha256 => {
            let digest = Sha256::digest(data);
            let padding = Pkcs1v15Sign::new::<Sha256>();
            Ok(private_key.sign(padding, &digest)?)
        }
        SignatureAlgorithm::RsaPkcs1V15WithSha512 => {
            let digest = Sha512::digest(data);
            let padding = Pkcs1v15Sign::new::<Sha512>();
            Ok(private_key.sign(padding, &digest)?)
        }
        other => Err(ResealError::KeyAlgorithmUnsupported(format!(
            "signing with {:?} (id 0x{:04x}) is not supported",
            other,
            other.id()
        )))
    }
}

/// Verifies a signature produced by [sign_data].
pub fn verify_data(
    public_key: &RsaPublicKey,
    algorithm: SignatureAlgorithm,
    data: &[u8],
    signature: &[u8]
) -> Result<bool> {
    let ok = match algorithm {
        SignatureAlgorithm::RsaPkcs1V15WithSha256
        | SignatureAlgorithm::VerityRsaPkcs1V15WithSha256 => {
            let digest = Sha256::digest(data);
            let padding = Pkcs1v15Sign::new::<Sha256>();
            public_key.verify(padding, &digest, signature).is_ok()
        }
        SignatureAlgorithm::RsaPkcs1V15WithSha512 => {
            let digest = Sha512::digest(data);
            let padding = Pkcs1v15Sign::new::<Sha512>();
            public_key.verify(padding, &digest, signature).is_ok()
        }
        other => {
            return Err(ResealError::KeyAlgorithmUnsupported(format!(
                "verifying with {:?} (id 0x{:04x}) is not supported",
                other,
                other.id()
            )))
        }
    };
    Ok(ok)
}

/// Produces one `(algorithm id, signature)` pair per algorithm configured
/// on the signer, in the signer's (strongest-first) order. A verifier only
/// needs any one of them to succeed.
pub fn generate_signatures_over_data(
    config: &SchemeSignerConfig,
    data: &[u8]
) -> Result<Vec<(u32, Vec<u8>)>> {
    let mut signatures = Vec::with_capacity(config.algorithms.len());
    for algorithm in &config.algorithms {
        let signature = sign_data(&config.private_key, *algorithm, data)?;
        signatures.push((algorithm.id(), signature));
    }
    Ok(signatures)
}
