/*
 * Copyright (c) 2021 gematik GmbH
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *    http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use std::io::Error as IoError;
use std::str::Utf8Error;

use base64::DecodeError as Base64Error;
use openssl::error::ErrorStack as SslError;
use thiserror::Error;
use xmldom::Error as XmlError;

use crate::{DataType, DataTypes};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO Error: {0}")]
    IoError(IoError),

    #[error("XML Error: {0}")]
    XmlError(XmlError),

    #[error("SSL Error: {0}")]
    SslError(SslError),

    #[error("Base64 Error: {0}")]
    Base64Error(Base64Error),

    #[error("Invalid UTF-8: {0}")]
    Utf8Error(Utf8Error),

    #[error("Marshal Error: {0}")]
    MarshalError(String),

    #[error("Algorithm not supported: {0}")]
    AlgorithmUnsupported(String),

    #[error("Transform Error: {0}")]
    TransformError(String),

    #[error("Canonicalization Error: {0}")]
    CanonicalizationError(String),

    #[error("Digest Error: {0}")]
    DigestError(String),

    #[error("Signature Error: {0}")]
    SignatureError(String),

    #[error("Encryption Error: {0}")]
    EncryptionError(String),

    #[error("Key Resolution Error: {0}")]
    KeyResolutionError(String),

    #[error("Dereference Error: {0}")]
    DereferenceError(String),

    #[error("Invalid State: {0}")]
    InvalidState(String),

    #[error("Invalid Input: {0}")]
    InvalidInput(String),

    #[error("Registry is already initialized!")]
    AlreadyInitialized,

    #[error("Unexpected Data Type: {0:?}!")]
    UnexpectedDataType(DataType),

    #[error("Invalid Data Type (actual={actual:?}, expected={expected:?})!")]
    InvalidDataType {
        actual: Option<DataType>,
        expected: DataTypes,
    },
}

impl Error {
    /// Wraps internal failures at the signature boundary, preserving the
    /// cause. Marshal and secure-validation errors pass through untouched.
    pub(crate) fn into_signature(self) -> Self {
        match self {
            Self::SignatureError(_)
            | Self::MarshalError(_)
            | Self::AlgorithmUnsupported(_)
            | Self::InvalidState(_)
            | Self::InvalidInput(_) => self,
            x => Self::SignatureError(x.to_string()),
        }
    }

    /// Wraps internal failures at the cipher boundary, preserving the
    /// cause.
    pub(crate) fn into_encryption(self) -> Self {
        match self {
            Self::EncryptionError(_)
            | Self::MarshalError(_)
            | Self::AlgorithmUnsupported(_)
            | Self::KeyResolutionError(_)
            | Self::InvalidState(_)
            | Self::InvalidInput(_) => self,
            x => Self::EncryptionError(x.to_string()),
        }
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Self::IoError(err)
    }
}

impl From<XmlError> for Error {
    fn from(err: XmlError) -> Self {
        Self::XmlError(err)
    }
}

impl From<SslError> for Error {
    fn from(err: SslError) -> Self {
        Self::SslError(err)
    }
}

impl From<Base64Error> for Error {
    fn from(err: Base64Error) -> Self {
        Self::Base64Error(err)
    }
}

impl From<Utf8Error> for Error {
    fn from(err: Utf8Error) -> Self {
        Self::Utf8Error(err)
    }
}
