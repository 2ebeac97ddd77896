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

use std::{io, rc::Rc};

use deku::prelude::*;
use rsa::pkcs8;
use zip::result::ZipError;

/// Common error type making it easier to share `Result`s between RESEAL
/// crates.
///
/// In general designed to avoid needing utilities like `map_err`.
#[derive(Debug, Clone)]
pub enum ResealError {
    /// reseal-cli encountered an error while processing something specific
    /// to the command line implementation. For example, not enough arguments
    /// were passed via the shell.
    Cli(String),
    /// The engine was built without a single signer config. At least one
    /// signing identity is required before any signing work can start.
    NoSignersConfigured,
    /// Two signer configs map to the same (sanitised) v1 signer name. The
    /// signature file names would collide inside META-INF/, so this is
    /// rejected up front.
    SignerNameCollision(String),
    /// The supplied certificate lineage and minimum SDK version cannot be
    /// reconciled: either the lineage is missing its oldest signer, or no
    /// combination of signers covers every targeted platform version.
    LineageIncompatible(String),
    /// A signer's key algorithm has no usable signature algorithm for the
    /// requested scheme at the configured minimum SDK version.
    KeyAlgorithmUnsupported(String),
    /// An existing APK Signing Block was supplied for signature
    /// preservation but its binary structure could not be parsed.
    MalformedSigningBlock(String),
    /// A source stamp block exists but its binary structure is broken.
    /// Only the stamp *verifier* downgrades this to a warning; everywhere
    /// else it is fatal.
    MalformedSourceStamp(String),
    /// AndroidManifest.xml could not be parsed far enough to decide whether
    /// the package declares itself debuggable.
    MalformedAndroidManifest(String),
    /// A caller drove the engine out of protocol order: finalising with
    /// outstanding data requests, fulfilling a request twice, inserting a
    /// signing block that was never produced. This indicates caller misuse
    /// rather than bad input.
    ContractViolation(String),
    /// The package declares android:debuggable="true" and the engine policy
    /// forbids signing debuggable archives. Carries the entry name that
    /// triggered the rejection.
    DebuggableApkRejected(String),
    /// Something went wrong serialising a binary block. See [DekuError].
    ByteSerialisationFailed(DekuError),
    /// An error occurred while a file was being written to disk. Only
    /// reseal-cli interacts with the disk, so a bad output path or a full
    /// disk are the likely causes.
    FileIoError(Rc<io::Error>),
    /// `reseal-zip` failed to create a zip file in-memory.
    ZipWritingFailed(Rc<ZipError>),
    /// The ZIP End Of Central Directory marker was not found, so the
    /// entries / central directory / EOCD sections could not be located.
    ZipSectionsNotFound,
    /// An error occurred while trying to instantiate signer keys from a
    /// `.pem` string.
    SignerPemParsingFailed(Rc<pem::PemError>),
    /// The `.pem` file was valid, but it was missing either a certificate
    /// or private key.
    SignerNoKeys,
    /// The `PRIVATE KEY` in the `.pem` was present, but it wasn't an RSA
    /// Private Key.
    SignerRsaPrivateKeyParsingFailed(pkcs8::Error),
    /// An error occurred while signing a hash, see [rsa::Error].
    SignerRsaSigningFailed(Rc<rsa::Error>),
    /// An error occurred while serialising the RSA key, see
    /// [pkcs8::spki::Error].
    SignerRsaKeySerialisationFailed(pkcs8::spki::Error),
    /// A signing certificate couldn't be decoded from its DER form.
    SignerCertificateDecodingFailed(Rc<rasn::error::DecodeError>),
    /// V1 signing data couldn't be serialised as PKCS#7.
    SignerPkcs7EncodingFailed(Rc<rasn::error::EncodeError>)
}

/// Result type where the error is always [ResealError].
pub type Result<T> = std::result::Result<T, ResealError>;

impl From<ResealError> for String {
    fn from(value: ResealError) -> Self {
        format!("{:?}", value)
    }
}

// Automatic conversion from other types of error to ResealError makes the
// rest of the code cleaner
impl From<io::Error> for ResealError {
    fn from(value: io::Error) -> Self {
        ResealError::FileIoError(value.into())
    }
}

impl From<DekuError> for ResealError {
    fn from(value: DekuError) -> Self {
        ResealError::ByteSerialisationFailed(value)
    }
}

impl From<ZipError> for ResealError {
    fn from(value: ZipError) -> Self {
        ResealError::ZipWritingFailed(value.into())
    }
}

impl From<pem::PemError> for ResealError {
    fn from(value: pem::PemError) -> Self {
        ResealError::SignerPemParsingFailed(value.into())
    }
}

impl From<pkcs8::Error> for ResealError {
    fn from(value: pkcs8::Error) -> Self {
        ResealError::SignerRsaPrivateKeyParsingFailed(value)
    }
}

impl From<rsa::Error> for ResealError {
    fn from(value: rsa::Error) -> Self {
        ResealError::SignerRsaSigningFailed(value.into())
    }
}

impl From<pkcs8::spki::Error> for ResealError {
    fn from(value: pkcs8::spki::Error) -> Self {
        ResealError::SignerRsaKeySerialisationFailed(value)
    }
}

impl From<rasn::error::DecodeError> for ResealError {
    fn from(value: rasn::error::DecodeError) -> Self {
        ResealError::SignerCertificateDecodingFailed(value.into())
    }
}

impl From<rasn::error::EncodeError> for ResealError {
    fn from(value: rasn::error::EncodeError) -> Self {
        ResealError::SignerPkcs7EncodingFailed(value.into())
    }
}
