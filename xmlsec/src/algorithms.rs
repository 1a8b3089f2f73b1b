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

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use openssl::hash::MessageDigest;
use openssl::symm::Cipher;
use xmldom::{C14nMode, Document, NodeId};

use crate::transform::Transform;
use crate::Error;

pub const NS_XMLDSIG: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const NS_XMLENC: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const NS_XPATH_FILTER2: &str = "http://www.w3.org/2002/06/xmldsig-filter2";

pub const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";
pub const DIGEST_RIPEMD160: &str = "http://www.w3.org/2001/04/xmlenc#ripemd160";
pub const DIGEST_MD5: &str = "http://www.w3.org/2001/04/xmldsig-more#md5";

pub const TRANSFORM_C14N_1_0: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const TRANSFORM_C14N_1_0_WITH_COMMENTS: &str =
    "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments";
pub const TRANSFORM_C14N_1_1: &str = "http://www.w3.org/2006/12/xml-c14n11";
pub const TRANSFORM_C14N_1_1_WITH_COMMENTS: &str =
    "http://www.w3.org/2006/12/xml-c14n11#WithComments";
pub const TRANSFORM_C14N_EXCLUSIVE: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const TRANSFORM_C14N_EXCLUSIVE_WITH_COMMENTS: &str =
    "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";
pub const TRANSFORM_BASE64: &str = "http://www.w3.org/2000/09/xmldsig#base64";
pub const TRANSFORM_XPATH: &str = "http://www.w3.org/TR/1999/REC-xpath-19991116";
pub const TRANSFORM_XPATH2: &str = "http://www.w3.org/2002/06/xmldsig-filter2";
pub const TRANSFORM_ENVELOPED_SIGNATURE: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

pub const CIPHER_TRIPLEDES: &str = "http://www.w3.org/2001/04/xmlenc#tripledes-cbc";
pub const CIPHER_AES128: &str = "http://www.w3.org/2001/04/xmlenc#aes128-cbc";
pub const CIPHER_AES192: &str = "http://www.w3.org/2001/04/xmlenc#aes192-cbc";
pub const CIPHER_AES256: &str = "http://www.w3.org/2001/04/xmlenc#aes256-cbc";

pub const KEYTRANSPORT_RSA_1_5: &str = "http://www.w3.org/2001/04/xmlenc#rsa-1_5";
pub const KEYTRANSPORT_RSA_OAEP: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p";
pub const KEYWRAP_TRIPLEDES: &str = "http://www.w3.org/2001/04/xmlenc#kw-tripledes";
pub const KEYWRAP_AES128: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes128";
pub const KEYWRAP_AES192: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes192";
pub const KEYWRAP_AES256: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes256";

pub const SIGNATURE_RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub const SIGNATURE_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

pub const ENCRYPTION_TYPE_ELEMENT: &str = "http://www.w3.org/2001/04/xmlenc#Element";
pub const ENCRYPTION_TYPE_CONTENT: &str = "http://www.w3.org/2001/04/xmlenc#Content";

/// Transform chain length accepted under secure validation.
pub const SECURE_VALIDATION_MAX_TRANSFORMS: usize = 5;

pub type TransformFactory = fn(&Document, NodeId) -> Result<Box<dyn Transform>, Error>;

/// Canonicalization algorithm resolved from a URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct C14nAlgorithm {
    pub mode: C14nMode,
    pub with_comments: bool,
}

/// Block cipher resolved from a URI.
#[derive(Clone, Copy)]
pub struct BlockCipher {
    pub uri: &'static str,
    cipher: fn() -> Cipher,
}

impl BlockCipher {
    pub fn cipher(&self) -> Cipher {
        (self.cipher)()
    }

    pub fn key_len(&self) -> usize {
        self.cipher().key_len()
    }

    pub fn block_size(&self) -> usize {
        self.cipher().block_size()
    }

    pub fn iv_len(&self) -> usize {
        self.cipher().iv_len().unwrap_or_else(|| self.block_size())
    }
}

/// Key wrap and key transport algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyWrapAlgorithm {
    Aes128Kw,
    Aes192Kw,
    Aes256Kw,
    TripleDesKw,
    Rsa15,
    RsaOaep,
}

impl KeyWrapAlgorithm {
    /// Expected KEK length for the symmetric wrap algorithms.
    pub fn kek_len(&self) -> Option<usize> {
        match self {
            Self::Aes128Kw => Some(16),
            Self::Aes192Kw => Some(24),
            Self::Aes256Kw => Some(32),
            Self::TripleDesKw => Some(24),
            Self::Rsa15 | Self::RsaOaep => None,
        }
    }
}

/// Maps algorithm URIs to primitives.
///
/// [`Registry::global`] is the process wide instance; it seals itself on
/// first lookup, after which transform registration fails with
/// [`Error::AlreadyInitialized`]. [`Registry::scoped`] yields an
/// independent instance for tests.
pub struct Registry {
    digests: HashMap<&'static str, fn() -> MessageDigest>,
    ciphers: HashMap<&'static str, BlockCipher>,
    key_wraps: HashMap<&'static str, KeyWrapAlgorithm>,
    canonicalizers: HashMap<&'static str, C14nAlgorithm>,
    key_algorithms: HashMap<&'static str, &'static str>,
    transforms: RwLock<HashMap<String, TransformFactory>>,
    denied: RwLock<HashSet<String>>,
    sealed: AtomicBool,
}

lazy_static! {
    static ref GLOBAL: Registry = Registry::builtin();
}

impl Registry {
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Fresh registry with the built-in algorithm set.
    pub fn scoped() -> Registry {
        Self::builtin()
    }

    fn builtin() -> Self {
        let mut digests: HashMap<&'static str, fn() -> MessageDigest> = HashMap::new();
        digests.insert(DIGEST_SHA1, MessageDigest::sha1);
        digests.insert(DIGEST_SHA256, MessageDigest::sha256);
        digests.insert(DIGEST_SHA512, MessageDigest::sha512);
        digests.insert(DIGEST_RIPEMD160, MessageDigest::ripemd160);
        digests.insert(DIGEST_MD5, MessageDigest::md5);

        let mut ciphers = HashMap::new();
        ciphers.insert(
            CIPHER_TRIPLEDES,
            BlockCipher {
                uri: CIPHER_TRIPLEDES,
                cipher: Cipher::des_ede3_cbc,
            },
        );
        ciphers.insert(
            CIPHER_AES128,
            BlockCipher {
                uri: CIPHER_AES128,
                cipher: Cipher::aes_128_cbc,
            },
        );
        ciphers.insert(
            CIPHER_AES192,
            BlockCipher {
                uri: CIPHER_AES192,
                cipher: Cipher::aes_192_cbc,
            },
        );
        ciphers.insert(
            CIPHER_AES256,
            BlockCipher {
                uri: CIPHER_AES256,
                cipher: Cipher::aes_256_cbc,
            },
        );

        let mut key_wraps = HashMap::new();
        key_wraps.insert(KEYWRAP_AES128, KeyWrapAlgorithm::Aes128Kw);
        key_wraps.insert(KEYWRAP_AES192, KeyWrapAlgorithm::Aes192Kw);
        key_wraps.insert(KEYWRAP_AES256, KeyWrapAlgorithm::Aes256Kw);
        key_wraps.insert(KEYWRAP_TRIPLEDES, KeyWrapAlgorithm::TripleDesKw);
        key_wraps.insert(KEYTRANSPORT_RSA_1_5, KeyWrapAlgorithm::Rsa15);
        key_wraps.insert(KEYTRANSPORT_RSA_OAEP, KeyWrapAlgorithm::RsaOaep);

        let mut canonicalizers = HashMap::new();
        canonicalizers.insert(
            TRANSFORM_C14N_1_0,
            C14nAlgorithm {
                mode: C14nMode::C14n_1_0,
                with_comments: false,
            },
        );
        canonicalizers.insert(
            TRANSFORM_C14N_1_0_WITH_COMMENTS,
            C14nAlgorithm {
                mode: C14nMode::C14n_1_0,
                with_comments: true,
            },
        );
        canonicalizers.insert(
            TRANSFORM_C14N_1_1,
            C14nAlgorithm {
                mode: C14nMode::C14n_1_1,
                with_comments: false,
            },
        );
        canonicalizers.insert(
            TRANSFORM_C14N_1_1_WITH_COMMENTS,
            C14nAlgorithm {
                mode: C14nMode::C14n_1_1,
                with_comments: true,
            },
        );
        canonicalizers.insert(
            TRANSFORM_C14N_EXCLUSIVE,
            C14nAlgorithm {
                mode: C14nMode::C14n_Exclusive_1_0,
                with_comments: false,
            },
        );
        canonicalizers.insert(
            TRANSFORM_C14N_EXCLUSIVE_WITH_COMMENTS,
            C14nAlgorithm {
                mode: C14nMode::C14n_Exclusive_1_0,
                with_comments: true,
            },
        );

        let mut key_algorithms = HashMap::new();
        key_algorithms.insert(KEYTRANSPORT_RSA_1_5, "RSA");
        key_algorithms.insert(KEYTRANSPORT_RSA_OAEP, "RSA");
        key_algorithms.insert(KEYWRAP_AES128, "AES");
        key_algorithms.insert(KEYWRAP_AES192, "AES");
        key_algorithms.insert(KEYWRAP_AES256, "AES");
        key_algorithms.insert(KEYWRAP_TRIPLEDES, "DESede");
        key_algorithms.insert(CIPHER_AES128, "AES");
        key_algorithms.insert(CIPHER_AES192, "AES");
        key_algorithms.insert(CIPHER_AES256, "AES");
        key_algorithms.insert(CIPHER_TRIPLEDES, "DESede");

        let mut denied = HashSet::new();
        denied.insert(DIGEST_MD5.to_owned());

        Self {
            digests,
            ciphers,
            key_wraps,
            canonicalizers,
            key_algorithms,
            transforms: RwLock::new(HashMap::new()),
            denied: RwLock::new(denied),
            sealed: AtomicBool::new(false),
        }
    }

    fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn lookup_digest(&self, uri: &str) -> Result<MessageDigest, Error> {
        self.seal();

        self.digests
            .get(uri)
            .map(|digest| digest())
            .ok_or_else(|| Error::AlgorithmUnsupported(uri.into()))
    }

    pub fn lookup_cipher(&self, uri: &str) -> Result<BlockCipher, Error> {
        self.seal();

        self.ciphers
            .get(uri)
            .copied()
            .ok_or_else(|| Error::AlgorithmUnsupported(uri.into()))
    }

    pub fn lookup_key_wrap(&self, uri: &str) -> Result<KeyWrapAlgorithm, Error> {
        self.seal();

        self.key_wraps
            .get(uri)
            .copied()
            .ok_or_else(|| Error::AlgorithmUnsupported(uri.into()))
    }

    pub fn lookup_canonicalizer(&self, uri: &str) -> Result<C14nAlgorithm, Error> {
        self.seal();

        self.canonicalizers
            .get(uri)
            .copied()
            .ok_or_else(|| Error::AlgorithmUnsupported(uri.into()))
    }

    /// Key kind required by an algorithm, e.g. `"RSA"` or `"AES"`.
    pub fn lookup_key_algorithm(&self, uri: &str) -> Result<&'static str, Error> {
        self.seal();

        self.key_algorithms
            .get(uri)
            .copied()
            .ok_or_else(|| Error::AlgorithmUnsupported(uri.into()))
    }

    pub fn lookup_transform(&self, uri: &str) -> Result<TransformFactory, Error> {
        self.seal();

        if let Some(factory) = self.transforms.read().unwrap().get(uri) {
            return Ok(*factory);
        }

        crate::transform::builtin_factory(uri).ok_or_else(|| Error::AlgorithmUnsupported(uri.into()))
    }

    /// Registers an additional transform. Permitted only before the first
    /// lookup.
    pub fn register_transform(&self, uri: &str, factory: TransformFactory) -> Result<(), Error> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::AlreadyInitialized);
        }

        self.transforms
            .write()
            .unwrap()
            .insert(uri.into(), factory);

        Ok(())
    }

    /// True if the algorithm is forbidden under secure validation.
    pub fn is_denied(&self, uri: &str) -> bool {
        self.denied.read().unwrap().contains(uri)
    }

    /// Extends the secure-validation deny list.
    pub fn deny(&self, uri: &str) {
        self.denied.write().unwrap().insert(uri.into());
    }

    /// Checks that the URI names a known encryption or key wrap algorithm.
    pub fn require_encryption_algorithm(&self, uri: &str) -> Result<(), Error> {
        self.seal();

        if self.ciphers.contains_key(uri) || self.key_wraps.contains_key(uri) {
            Ok(())
        } else {
            Err(Error::AlgorithmUnsupported(uri.into()))
        }
    }
}
