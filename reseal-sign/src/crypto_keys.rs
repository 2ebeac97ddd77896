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

use std::collections::HashMap;

use reseal_common::*;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePublicKey},
    RsaPrivateKey, RsaPublicKey
};

use crate::algorithms::SignatureAlgorithm;
use crate::lineage::SigningCertificateLineage;

/// One signing identity: a name, an RSA key pair and the ordered X.509
/// certificate chain whose first certificate belongs to the private key.
///
/// The engine and every scheme signer treat the key and certificates as
/// opaque; nothing here interprets certificate contents.
#[derive(Clone)]
pub struct SignerConfig {
    /// Name used to derive the v1 signature file names (e.g. `CERT` becomes
    /// `META-INF/CERT.SF`).
    pub name: String,
    /// X.509 certificates in ASN.1 DER form, signing certificate first.
    pub certificates: Vec<Vec<u8>>,
    /// RSA Public Key
    pub public_key: RsaPublicKey,
    /// RSA Private Key
    pub private_key: RsaPrivateKey,
    /// Request deterministic signing where the cipher has a choice. RSA
    /// PKCS#1 v1.5 is deterministic either way; the flag is carried for
    /// callers that rotate to other key types later.
    pub deterministic_signing: bool
}

impl SignerConfig {
    /// Parses and creates an instance of [SignerConfig] from a `.pem` file.
    ///
    /// "Combined" in this case means that the one file has both a `BEGIN
    /// CERTIFICATE` and a `BEGIN PRIVATE KEY` section as one long UTF-8
    /// string.
    ///
    /// If you don't have one of these, use
    /// [generate_random_testing_keys](SignerConfig::generate_random_testing_keys).
    pub fn from_combined_pem_string(name: &str, combined_pem: &str) -> Result<SignerConfig> {
        let pem_map = parse_pem_map_by_tags(combined_pem)?;
        let certificate = pem_map
            .get("CERTIFICATE")
            .ok_or(ResealError::SignerNoKeys)?
            .clone();

        let priv_key_bytes = pem_map.get("PRIVATE KEY").ok_or(ResealError::SignerNoKeys)?;
        let private_key = RsaPrivateKey::from_pkcs8_der(priv_key_bytes)?;
        let public_key = RsaPublicKey::from(private_key.clone());

        Ok(SignerConfig {
            name: name.to_string(),
            certificates: vec![certificate],
            public_key,
            private_key,
            deterministic_signing: false
        })
    }

    /// Randomly generates RSA signing keys and an accompanying self-signed
    /// certificate.
    ///
    /// This API is only enabled when the optional "cert-gen" feature is
    /// enabled for reseal-sign (it's on by default). It introduces a
    /// non-trivial amount of extra dependencies, and generating an RSA key
    /// is slow, so it's recommended that you generate keys with OpenSSL and
    /// pass them in to [SignerConfig::from_combined_pem_string].
    ///
    /// Randomly generated keys also hinder publishing updates: an update
    /// must be signed with the same key as the installed version, so an
    /// archive signed with throwaway keys can only be installed fresh.
    #[cfg(feature = "cert-gen")]
    pub fn generate_random_testing_keys(name: &str) -> Result<SignerConfig> {
        // These dependencies only exist when compiled with cert-gen
        use rand::prelude::*;
        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};

        eprintln!("Warning: Randomly generating a placeholder signing key. This is slow!");
        eprintln!("    It's recommended to generate your own keys first and pass them in.");

        let private_key = RsaPrivateKey::new(&mut thread_rng(), 2048)?;
        let public_key = RsaPublicKey::from(private_key.clone());
        let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();

        // Self-sign an X.509 certificate using the random keys
        let key_pair = KeyPair::from_pem(&private_key_pem).unwrap();
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, env!("CARGO_PKG_NAME"));
        let mut cert_params = CertificateParams::new(vec![]).unwrap();
        cert_params.distinguished_name = distinguished_name;
        let cert = cert_params.self_signed(&key_pair).unwrap();

        Ok(SignerConfig {
            name: name.to_string(),
            certificates: vec![cert.der().to_vec()],
            public_key,
            private_key,
            deterministic_signing: false
        })
    }

    /// The signing certificate (first in the chain) in DER form.
    pub fn signing_certificate(&self) -> &[u8] {
        &self.certificates[0]
    }

    /// Returns the RSA Public Key encoded as an ASN.1 DER
    /// SubjectPublicKeyInfo.
    pub fn pub_key_as_der(&self) -> Result<Vec<u8>> {
        Ok(self.public_key.to_public_key_der()?.as_ref().to_vec())
    }
}

/// A signer materialised for one particular scheme: the identity plus the
/// signature algorithms to produce and the SDK window the signer covers.
/// Derived from [SignerConfig]s at signing time and discarded afterwards.
#[derive(Clone)]
pub struct SchemeSignerConfig {
    pub certificates: Vec<Vec<u8>>,
    pub public_key: RsaPublicKey,
    pub private_key: RsaPrivateKey,
    /// Algorithms to sign with, strongest first. Empty means "no usable
    /// algorithm"; the lineage resolver decides whether that is fatal.
    pub algorithms: Vec<SignatureAlgorithm>,
    pub min_sdk_version: u32,
    pub max_sdk_version: u32,
    /// Sub-lineage ending at this signer's certificate, when certificate
    /// rotation history applies to the scheme.
    pub lineage: Option<SigningCertificateLineage>
}

impl SchemeSignerConfig {
    pub fn new(
        config: &SignerConfig,
        algorithms: Vec<SignatureAlgorithm>,
        min_sdk_version: u32,
        max_sdk_version: u32
    ) -> SchemeSignerConfig {
        SchemeSignerConfig {
            certificates: config.certificates.clone(),
            public_key: config.public_key.clone(),
            private_key: config.private_key.clone(),
            algorithms,
            min_sdk_version,
            max_sdk_version,
            lineage: None
        }
    }

    pub fn signing_certificate(&self) -> &[u8] {
        &self.certificates[0]
    }

    pub fn pub_key_as_der(&self) -> Result<Vec<u8>> {
        Ok(self.public_key.to_public_key_der()?.as_ref().to_vec())
    }
}

/// Parses a .pem file and returns a map of Tag -> Contents
fn parse_pem_map_by_tags(combined_pem: &str) -> Result<HashMap<String, Vec<u8>>> {
    let parsed = pem::parse_many(combined_pem)?;
    let mut map = HashMap::new();
    for pem_part in parsed {
        map.insert(pem_part.tag().into(), pem_part.into_contents());
    }
    Ok(map)
}
