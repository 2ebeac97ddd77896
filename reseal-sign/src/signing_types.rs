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

// Binary layout of the APK Signing Block and the v2/v3 signer records,
// named according to the APK Signature Scheme v2/v3 docs.
use deku::prelude::*;

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct ApkSigningBlock {
    // Size of this structure MINUS this field!
    // This field appears twice, the 'minus' is only for one of them.
    // So if the structure is 128 bytes, this reads 120, NOT 112.
    pub size_of_self_not_counted: u64,
    pub pairs: SigningBlockPairs,
    pub size_of_self_counted: u64,
    pub magic: [u8; 16]
}

// This is in its own block so that we can determine its size before
// serialising its parent
#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct SigningBlockPairs {
    pub pairs: Vec<U64LengthPrefixed<SigningBlockIdValuePair>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct SigningBlockIdValuePair {
    pub id: u32,
    pub value: Vec<u8>
}

/// One scheme block: a length-prefixed list of length-prefixed signers.
/// The signers are kept as raw byte blobs so that signers preserved from a
/// pre-existing archive can sit next to freshly generated ones.
#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct SignatureSchemeBlock {
    pub signers: U32LengthPrefixed<Vec<U32LengthPrefixed<Vec<u8>>>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct Signer {
    pub signed_data: U32LengthPrefixed<SignedData>,
    pub signatures: U32LengthPrefixed<Vec<U32LengthPrefixed<Signature>>>,
    // SubjectPublicKeyInfo, ASN.1 DER form
    pub public_key: U32LengthPrefixed<Vec<u8>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct V3Signer {
    pub signed_data: U32LengthPrefixed<V3SignedData>,

    pub min_sdk: u32,
    pub max_sdk: u32,

    pub signatures: U32LengthPrefixed<Vec<U32LengthPrefixed<Signature>>>,
    // SubjectPublicKeyInfo, ASN.1 DER form
    pub public_key: U32LengthPrefixed<Vec<u8>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct Signature {
    pub signature_algorithm_id: u32,
    pub signature: U32LengthPrefixed<Vec<u8>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct SignedData {
    pub digests: U32LengthPrefixed<Vec<U32LengthPrefixed<Digest>>>,
    // Array of X.509 Certificates (ASN.1 DER form) as bytes
    pub certificates: U32LengthPrefixed<Vec<U32LengthPrefixed<Vec<u8>>>>,
    // Encoded attribute sequence, see [encode_attribute]
    pub additional_attributes: U32LengthPrefixed<Vec<u8>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct V3SignedData {
    pub digests: U32LengthPrefixed<Vec<U32LengthPrefixed<Digest>>>,
    // Array of X.509 Certificates (ASN.1 DER form) as bytes
    pub certificates: U32LengthPrefixed<Vec<U32LengthPrefixed<Vec<u8>>>>,
    pub min_sdk: u32,
    pub max_sdk: u32,
    pub additional_attributes: U32LengthPrefixed<Vec<u8>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct Digest {
    pub signature_algorithm_id: u32,
    pub digest: U32LengthPrefixed<Vec<u8>>
}

// Helper structures

// Outer APK Signing Block structures use u64 lengths
#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct U64LengthPrefixed<T: DekuWriter> {
    pub length: u64,
    pub value: T
}
// The "Integrity-protected contents" block uses u32 lengths
#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct U32LengthPrefixed<T: DekuWriter> {
    pub length: u32,
    pub value: T
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct RawWrapper<T: DekuWriter> {
    pub value: T
}

// Constructs length-prefixed things
pub fn len_pfx_u32<T: DekuWriter + Clone>(thing: T) -> U32LengthPrefixed<T> {
    let wrap = RawWrapper {
        value: thing.clone()
    };

    U32LengthPrefixed {
        length: wrap.to_bytes().unwrap().len() as u32,
        value: thing
    }
}

pub fn len_pfx_u64<T: DekuWriter + Clone>(thing: T) -> U64LengthPrefixed<T> {
    let wrap = RawWrapper {
        value: thing.clone()
    };

    U64LengthPrefixed {
        length: wrap.to_bytes().unwrap().len() as u64,
        value: thing
    }
}

/// Encodes one additional attribute: `uint32 length ‖ uint32 id ‖ value`,
/// where the length covers the id and the value.
pub fn encode_attribute(id: u32, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&((4 + value.len()) as u32).to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(value);
    out
}

/// Builds the digest record list for a signer: one record per signature
/// algorithm, in the signer's algorithm order, referencing the content
/// digest that algorithm binds to.
pub fn digest_records(
    algorithms: &[crate::algorithms::SignatureAlgorithm],
    content_digests: &std::collections::BTreeMap<crate::algorithms::ContentDigestAlgorithm, Vec<u8>>
) -> Vec<U32LengthPrefixed<Digest>> {
    algorithms
        .iter()
        .map(|algorithm| {
            let digest = content_digests
                .get(&algorithm.content_digest_algorithm())
                .expect("content digest computed for every configured algorithm")
                .clone();
            len_pfx_u32(Digest {
                signature_algorithm_id: algorithm.id(),
                digest: len_pfx_u32(digest)
            })
        })
        .collect()
}

/// Length-prefixes each certificate of a chain, leaf first.
pub fn certificate_records(certificates: &[Vec<u8>]) -> Vec<U32LengthPrefixed<Vec<u8>>> {
    certificates.iter().map(|cert| len_pfx_u32(cert.clone())).collect()
}
