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

//! The legacy JAR signing scheme (v1): a MANIFEST.MF digesting every
//! entry, one .SF file per signer digesting the manifest, and a PKCS#7
//! signature block over each .SF.
//!
//! Text output follows the historical JAR conventions: CRLF line endings,
//! 70-byte line wrapping with space-prefixed continuations, and one blank
//! line between sections.

use std::collections::BTreeMap;

use base64::{prelude::BASE64_STANDARD, Engine};
use reseal_common::*;
use rasn::types::Integer::Primitive;
use rasn::types::Oid;
use rasn::{Decode, Encode};
use rasn_cms::algorithms::RSA;
use rasn_cms::ContentInfo;
use rasn_cms::{
    pkcs7_compat::SignedData, Certificate, CertificateChoices, IssuerAndSerialNumber,
    SignerIdentifier, SignerInfo
};
use rsa::Pkcs1v15Sign;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::algorithms::sdk;
use crate::crypto_keys::SignerConfig;

const OID_SHA256: &Oid =
    rasn::types::Oid::JOINT_ISO_ITU_T_COUNTRY_US_ORGANIZATION_GOV_CSOR_NIST_ALGORITHMS_HASH_SHA256;

// 1.3.14.3.2.26, the OIW SHA-1 id; rasn has no named constant for it
fn oid_sha1() -> &'static Oid {
    Oid::new_unchecked(&[1, 3, 14, 3, 2, 26])
}

const OID_PKCS7_DATA: &Oid = rasn::types::Oid::ISO_MEMBER_BODY_US_RSADSI_PKCS7_DATA;
const OID_PKCS7_SIGNED_DATA: &Oid = rasn::types::Oid::ISO_MEMBER_BODY_US_RSADSI_PKCS7_SIGNED_DATA;

pub const MANIFEST_ENTRY_NAME: &str = "META-INF/MANIFEST.MF";

/// Maximum content bytes per manifest line; the CRLF sits on top of this.
const MAX_LINE_LENGTH: usize = 70;

/// Digest algorithm used for v1 entry digests and signature digests.
/// Derive and Ord give the strength order: SHA-256 beats SHA-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum V1DigestAlgorithm {
    Sha1,
    Sha256
}

impl V1DigestAlgorithm {
    /// Name used in manifest attribute keys, e.g. `SHA-256-Digest`.
    pub fn jar_name(&self) -> &'static str {
        match self {
            V1DigestAlgorithm::Sha1 => "SHA1",
            V1DigestAlgorithm::Sha256 => "SHA-256"
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            V1DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            V1DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec()
        }
    }
}

/// Digest algorithm of comparable strength to the signature digest for an
/// RSA key at the given minimum platform version. SHA-256 manifests only
/// verify from JELLY_BEAN_MR2 onwards.
pub fn suggested_signature_digest_algorithm(min_sdk_version: u32) -> V1DigestAlgorithm {
    if min_sdk_version < sdk::JELLY_BEAN_MR2 {
        V1DigestAlgorithm::Sha1
    } else {
        V1DigestAlgorithm::Sha256
    }
}

/// One signer as the v1 scheme sees it.
#[derive(Clone)]
pub struct V1SignerConfig {
    /// Sanitised name, already run through [get_safe_signer_name].
    pub name: String,
    pub signer: SignerConfig,
    pub signature_digest_algorithm: V1DigestAlgorithm
}

/// JAR signer names become file names inside META-INF/, so they are capped
/// at 8 characters from a restricted alphabet, uppercased for case
/// insensitive filesystems.
pub fn get_safe_signer_name(name: &str) -> String {
    let mut safe = String::with_capacity(8);
    for c in name.chars().take(8) {
        let c = c.to_ascii_uppercase();
        if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_' {
            safe.push(c);
        } else {
            safe.push('_');
        }
    }
    if safe.is_empty() {
        safe.push('_');
    }
    safe
}

/// Whether an entry's digest belongs in the manifest. Directories and the
/// signature-related files inside META-INF/ stay out.
pub fn is_jar_entry_digest_needed(entry_name: &str) -> bool {
    if entry_name.ends_with('/') {
        return false;
    }
    if entry_name == MANIFEST_ENTRY_NAME {
        return false;
    }
    if let Some(meta_inf_name) = entry_name.strip_prefix("META-INF/") {
        // Signature files live directly in META-INF/, not in subdirectories
        if !meta_inf_name.contains('/') {
            let upper = meta_inf_name.to_ascii_uppercase();
            if upper.ends_with(".SF")
                || upper.ends_with(".RSA")
                || upper.ends_with(".DSA")
                || upper.ends_with(".EC")
                || upper.starts_with("SIG-")
            {
                return false;
            }
        }
    }
    true
}

/// Names of the entries the engine itself will emit for these signers.
pub fn output_entry_names(configs: &[V1SignerConfig]) -> std::collections::BTreeSet<String> {
    let mut names = std::collections::BTreeSet::new();
    names.insert(MANIFEST_ENTRY_NAME.to_string());
    for config in configs {
        names.insert(format!("META-INF/{}.SF", config.name));
        names.insert(format!("META-INF/{}.RSA", config.name));
    }
    names
}

/// A generated manifest plus the exact per-entry section bytes, which the
/// signature files digest individually.
pub struct OutputManifest {
    pub contents: Vec<u8>,
    pub main_section: Vec<u8>,
    pub individual_sections: Vec<(String, Vec<u8>)>
}

/// Builds MANIFEST.MF from the entry digests. When the input archive's
/// manifest is supplied its main attributes are carried over; only the
/// per-entry sections are regenerated.
pub fn generate_manifest_file(
    digest_algorithm: V1DigestAlgorithm,
    entry_digests: &BTreeMap<String, Vec<u8>>,
    input_manifest: Option<&[u8]>,
    created_by: &str
) -> OutputManifest {
    let mut main_attributes: Vec<(String, String)> = match input_manifest {
        Some(bytes) => parse_manifest(bytes).main_attributes,
        None => vec![]
    };
    if !main_attributes.iter().any(|(k, _)| k == "Manifest-Version") {
        main_attributes.insert(0, ("Manifest-Version".into(), "1.0".into()));
        main_attributes.push(("Created-By".into(), created_by.to_string()));
    }

    let mut main_section = Vec::new();
    for (key, value) in &main_attributes {
        write_attribute(&mut main_section, key, value);
    }
    main_section.extend_from_slice(b"\r\n");

    let mut contents = main_section.clone();
    let mut individual_sections = Vec::with_capacity(entry_digests.len());
    for (name, digest) in entry_digests {
        let mut section = Vec::new();
        write_attribute(&mut section, "Name", name);
        write_attribute(
            &mut section,
            &format!("{}-Digest", digest_algorithm.jar_name()),
            &BASE64_STANDARD.encode(digest)
        );
        section.extend_from_slice(b"\r\n");
        contents.extend_from_slice(&section);
        individual_sections.push((name.clone(), section));
    }

    OutputManifest {
        contents,
        main_section,
        individual_sections
    }
}

/// Generates the manifest and every signer's signature entries in one go.
pub fn sign(
    configs: &[V1SignerConfig],
    content_digest_algorithm: V1DigestAlgorithm,
    entry_digests: &BTreeMap<String, Vec<u8>>,
    apk_signature_scheme_ids: &[u32],
    input_manifest: Option<&[u8]>,
    created_by: &str
) -> Result<Vec<(String, Vec<u8>)>> {
    let manifest = generate_manifest_file(
        content_digest_algorithm,
        entry_digests,
        input_manifest,
        created_by
    );
    sign_manifest(configs, apk_signature_scheme_ids, created_by, &manifest)
}

/// Signs an already generated manifest: emits the manifest itself plus a
/// `.SF` and `.RSA` pair per signer.
pub fn sign_manifest(
    configs: &[V1SignerConfig],
    apk_signature_scheme_ids: &[u32],
    created_by: &str,
    manifest: &OutputManifest
) -> Result<Vec<(String, Vec<u8>)>> {
    let mut entries = Vec::with_capacity(1 + 2 * configs.len());
    entries.push((MANIFEST_ENTRY_NAME.to_string(), manifest.contents.clone()));
    for config in configs {
        let signature_file = generate_signature_file(
            config,
            apk_signature_scheme_ids,
            created_by,
            manifest
        );
        let signature_block = generate_signature_block(config, &signature_file)?;
        entries.push((format!("META-INF/{}.SF", config.name), signature_file));
        entries.push((format!("META-INF/{}.RSA", config.name), signature_block));
    }
    Ok(entries)
}

fn generate_signature_file(
    config: &V1SignerConfig,
    apk_signature_scheme_ids: &[u32],
    created_by: &str,
    manifest: &OutputManifest
) -> Vec<u8> {
    let algorithm = config.signature_digest_algorithm;
    let mut sf = Vec::new();
    write_attribute(&mut sf, "Signature-Version", "1.0");
    write_attribute(&mut sf, "Created-By", created_by);
    if !apk_signature_scheme_ids.is_empty() {
        // Advertise the modern schemes so a verifier notices if the
        // signing block has been stripped from the archive
        let ids = apk_signature_scheme_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write_attribute(&mut sf, "X-Android-APK-Signed", &ids);
    }
    write_attribute(
        &mut sf,
        &format!("{}-Digest-Manifest-Main-Attributes", algorithm.jar_name()),
        &BASE64_STANDARD.encode(algorithm.digest(&manifest.main_section))
    );
    write_attribute(
        &mut sf,
        &format!("{}-Digest-Manifest", algorithm.jar_name()),
        &BASE64_STANDARD.encode(algorithm.digest(&manifest.contents))
    );
    sf.extend_from_slice(b"\r\n");

    for (name, section) in &manifest.individual_sections {
        write_attribute(&mut sf, "Name", name);
        write_attribute(
            &mut sf,
            &format!("{}-Digest", algorithm.jar_name()),
            &BASE64_STANDARD.encode(algorithm.digest(section))
        );
        sf.extend_from_slice(b"\r\n");
    }

    sf
}

/// Detached PKCS#7 signature over the signature file, carrying the
/// signer's certificate chain.
fn generate_signature_block(config: &V1SignerConfig, signature_file: &[u8]) -> Result<Vec<u8>> {
    let (digest, digest_oid) = match config.signature_digest_algorithm {
        V1DigestAlgorithm::Sha1 => (
            Sha1::digest(signature_file).to_vec(),
            oid_sha1()
        ),
        V1DigestAlgorithm::Sha256 => (
            Sha256::digest(signature_file).to_vec(),
            OID_SHA256
        )
    };
    let signature = match config.signature_digest_algorithm {
        V1DigestAlgorithm::Sha1 => config
            .signer
            .private_key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)?,
        V1DigestAlgorithm::Sha256 => config
            .signer
            .private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?
    };

    let mut certificates = Vec::with_capacity(config.signer.certificates.len());
    for der in &config.signer.certificates {
        certificates.push(Certificate::decode(&mut rasn::ber::de::Decoder::new(
            der,
            rasn::ber::de::DecoderOptions::der()
        ))?);
    }
    let leaf = certificates[0].clone();

    let signer_info = SignerInfo {
        version: Primitive(1),
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: leaf.tbs_certificate.issuer.clone(),
            serial_number: leaf.tbs_certificate.serial_number.clone()
        }),
        digest_algorithm: rasn_cms::AlgorithmIdentifier {
            algorithm: digest_oid.into(),
            parameters: None
        },
        signed_attrs: None,
        signature_algorithm: rasn_cms::AlgorithmIdentifier {
            algorithm: RSA.into(),
            parameters: None
        },
        signature: signature.into(),
        unsigned_attrs: None
    };

    let signed_data = SignedData {
        version: Primitive(1),
        digest_algorithms: vec![rasn_cms::AlgorithmIdentifier {
            algorithm: digest_oid.into(),
            parameters: None
        }]
        .into(),
        encap_content_info: rasn_cms::pkcs7_compat::EncapsulatedContentInfo {
            content_type: OID_PKCS7_DATA.into(),
            content: None
        },
        certificates: Some(
            certificates
                .into_iter()
                .map(|cert| CertificateChoices::Certificate(Box::new(cert)))
                .collect::<Vec<_>>()
                .into()
        ),
        crls: None,
        signer_infos: vec![signer_info].into()
    };

    let mut inner_encoder = rasn::der::enc::Encoder::new(rasn::der::enc::EncoderOptions::der());
    signed_data.encode(&mut inner_encoder)?;
    let inner_vec = inner_encoder.output();

    let wrapper = ContentInfo {
        content_type: OID_PKCS7_SIGNED_DATA.into(),
        content: rasn::types::Any::new(inner_vec.clone())
    };

    let mut outer_encoder = rasn::der::enc::Encoder::new(rasn::der::enc::EncoderOptions::der());
    wrapper.encode(&mut outer_encoder)?;

    Ok(outer_encoder.output())
}

/// Writes `key: value` wrapped to the JAR line length, CRLF endings,
/// continuations prefixed with a space.
fn write_attribute(out: &mut Vec<u8>, key: &str, value: &str) {
    let line = format!("{key}: {value}");
    let bytes = line.as_bytes();
    let mut pos = 0;
    let mut first = true;
    while pos < bytes.len() {
        let budget = if first {
            MAX_LINE_LENGTH
        } else {
            out.push(b' ');
            MAX_LINE_LENGTH - 1
        };
        let end = (pos + budget).min(bytes.len());
        out.extend_from_slice(&bytes[pos..end]);
        out.extend_from_slice(b"\r\n");
        pos = end;
        first = false;
    }
}

/// A manifest split into its main attributes and named sections, with
/// continuation lines unfolded.
pub struct ParsedManifest {
    pub main_attributes: Vec<(String, String)>,
    /// Entry name -> attributes, in manifest order.
    pub entry_attributes: Vec<(String, Vec<(String, String)>)>
}

pub fn parse_manifest(bytes: &[u8]) -> ParsedManifest {
    let text = String::from_utf8_lossy(bytes);
    let mut sections: Vec<Vec<(String, String)>> = vec![vec![]];

    let mut logical_lines: Vec<String> = vec![];
    for raw_line in text.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.is_empty() {
            logical_lines.push(String::new());
        } else if let Some(continuation) = line.strip_prefix(' ') {
            if let Some(last) = logical_lines.last_mut() {
                last.push_str(continuation);
            }
        } else {
            logical_lines.push(line.to_string());
        }
    }

    let mut last_blank = false;
    for line in logical_lines {
        if line.is_empty() {
            if !last_blank && !sections.last().unwrap().is_empty() {
                sections.push(vec![]);
            }
            last_blank = true;
            continue;
        }
        last_blank = false;
        if let Some((key, value)) = line.split_once(": ") {
            sections.last_mut().unwrap().push((key.to_string(), value.to_string()));
        }
    }

    let mut sections = sections.into_iter().filter(|s| !s.is_empty());
    let main_attributes = sections.next().unwrap_or_default();
    let entry_attributes = sections
        .filter_map(|attrs| {
            let name = attrs.iter().find(|(k, _)| k == "Name")?.1.clone();
            Some((name, attrs))
        })
        .collect();

    ParsedManifest {
        main_attributes,
        entry_attributes
    }
}

/// Pulls the digest recorded for an entry out of a parsed manifest
/// section, for the given algorithm.
pub fn extract_entry_digest(
    attributes: &[(String, String)],
    algorithm: V1DigestAlgorithm
) -> Option<Vec<u8>> {
    let key = format!("{}-Digest", algorithm.jar_name());
    let value = &attributes.iter().find(|(k, _)| *k == key)?.1;
    BASE64_STANDARD.decode(value).ok()
}
