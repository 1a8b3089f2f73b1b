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

use std::str::from_utf8;

use base64::{decode, encode};
use log::warn;
use openssl::aes::{unwrap_key, wrap_key, AesKey};
use openssl::encrypt::{Decrypter as RsaDecrypter, Encrypter as RsaEncrypter};
use openssl::hash::{hash, MessageDigest};
use openssl::rsa::Padding;
use openssl::symm::{encrypt as cbc_encrypt, Cipher as SymmCipher, Crypter, Mode};
use rand::{thread_rng, Rng};
use xmldom::{Document, NodeId, NodeKind};

use crate::dereference::{dereference, DereferenceRequest};
use crate::signature::KeyPurpose;
use crate::transform::TransformContext;
use crate::{
    BlockCipher, Context, Error, Key, KeyWrapAlgorithm, Registry, SymmetricKey, VecSink,
    ENCRYPTION_TYPE_CONTENT, ENCRYPTION_TYPE_ELEMENT, NS_XMLENC,
    TRANSFORM_C14N_1_0_WITH_COMMENTS,
};

use super::{
    marshal_encrypted_data, marshal_encrypted_key, register_ids, unmarshal_encrypted_data,
    CipherData, DocumentSerializer, EncryptedData, EncryptedKey, EncryptionMethod,
    NODE_ENCRYPTED_DATA,
};

/// RFC 3217 fixed IV for the second TripleDES key wrap pass.
const TRIPLE_DES_KW_IV: [u8; 8] = [0x4a, 0xdd, 0xa2, 0x2c, 0x79, 0xe8, 0x21, 0x05];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Unset,
    Encrypt,
    Decrypt,
    Wrap,
    Unwrap,
}

/// Four-mode cipher facade for `EncryptedData` and `EncryptedKey`.
///
/// The mode gates the allowed operations; [`init`](Self::init) switches
/// the mode and discards any in-progress objects. The instance is not
/// safe for concurrent use.
pub struct XmlCipher {
    mode: CipherMode,
    algorithm: Option<String>,
    serializer: DocumentSerializer,
    key: Option<Key>,
    kek: Option<Key>,
    encrypted_data: Option<EncryptedData>,
    encrypted_key: Option<EncryptedKey>,
}

impl XmlCipher {
    /// A missing algorithm is accepted here: DECRYPT and UNWRAP read the
    /// algorithm from the consumed `EncryptionMethod`. ENCRYPT and WRAP
    /// operations fail at use time without one.
    pub fn new(algorithm: Option<&str>) -> Result<Self, Error> {
        if let Some(uri) = algorithm {
            Registry::global().require_encryption_algorithm(uri)?;
        }

        Ok(Self {
            mode: CipherMode::Unset,
            algorithm: algorithm.map(Into::into),
            serializer: DocumentSerializer::new(TRANSFORM_C14N_1_0_WITH_COMMENTS)?,
            key: None,
            kek: None,
            encrypted_data: None,
            encrypted_key: None,
        })
    }

    /// Selects the canonicalizer used to serialize plaintext.
    pub fn set_canonicalizer(&mut self, uri: &str) -> Result<(), Error> {
        self.serializer = DocumentSerializer::new(uri)?;

        Ok(())
    }

    pub fn set_kek(&mut self, key: Key) {
        self.kek = Some(key);
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Switches the cipher mode. Any in-progress `EncryptedData` or
    /// `EncryptedKey` is discarded; ENCRYPT and WRAP allocate a fresh one
    /// with a placeholder cipher value.
    pub fn init(&mut self, mode: CipherMode, key: Option<Key>) -> Result<(), Error> {
        self.encrypted_data = None;
        self.encrypted_key = None;

        match mode {
            CipherMode::Unset => {
                return Err(Error::InvalidInput("cannot init to the unset mode".into()))
            }
            CipherMode::Encrypt => {
                if key.is_none() {
                    return Err(Error::InvalidInput("ENCRYPT mode requires a key".into()));
                }

                self.key = key;
                self.encrypted_data = Some(EncryptedData::new(CipherData::with_value("")));
            }
            CipherMode::Decrypt => {
                // the key may instead be resolved from KeyInfo later
                self.key = key;
            }
            CipherMode::Wrap => {
                if key.is_none() {
                    return Err(Error::InvalidInput("WRAP mode requires a KEK".into()));
                }

                self.kek = key;
                self.encrypted_key = Some(EncryptedKey::new(CipherData::with_value("")));
            }
            CipherMode::Unwrap => {
                if let Some(key) = key {
                    self.kek = Some(key);
                }
            }
        }

        self.mode = mode;

        Ok(())
    }

    fn require_mode(&self, expected: CipherMode, operation: &str) -> Result<(), Error> {
        if self.mode != expected {
            return Err(Error::InvalidState(format!(
                "{} requires {:?} mode, cipher is in {:?} mode",
                operation, expected, self.mode
            )));
        }

        Ok(())
    }

    pub fn get_encrypted_data(&self) -> Option<&EncryptedData> {
        self.encrypted_data.as_ref()
    }

    pub fn get_encrypted_key(&self) -> Option<&EncryptedKey> {
        self.encrypted_key.as_ref()
    }

    /// In-progress `EncryptedData`, e.g. to attach a `KeyInfo` before
    /// `doFinal`.
    pub fn encrypted_data_mut(&mut self) -> Option<&mut EncryptedData> {
        self.encrypted_data.as_mut()
    }

    pub fn encrypted_key_mut(&mut self) -> Option<&mut EncryptedKey> {
        self.encrypted_key.as_mut()
    }

    /// Hands the in-progress `EncryptedData` to the caller.
    pub fn take_encrypted_data(&mut self) -> Option<EncryptedData> {
        self.encrypted_data.take()
    }

    /// Hands the in-progress `EncryptedKey` to the caller.
    pub fn take_encrypted_key(&mut self) -> Option<EncryptedKey> {
        self.encrypted_key.take()
    }

    /// Marshals the in-progress object of the current mode to a detached
    /// element.
    pub fn marshal(&self, doc: &mut Document) -> Result<NodeId, Error> {
        match self.mode {
            CipherMode::Encrypt => {
                let encrypted = self.encrypted_data.as_ref().ok_or_else(|| {
                    Error::InvalidState("no EncryptedData in progress".into())
                })?;

                marshal_encrypted_data(doc, encrypted)
            }
            CipherMode::Wrap => {
                let encrypted = self.encrypted_key.as_ref().ok_or_else(|| {
                    Error::InvalidState("no EncryptedKey in progress".into())
                })?;

                marshal_encrypted_key(doc, encrypted)
            }
            x => Err(Error::InvalidState(format!(
                "marshal is not available in {:?} mode",
                x
            ))),
        }
    }

    /// ENCRYPT: replaces `element` (or its content) with the marshaled
    /// `EncryptedData`. DECRYPT: replaces the `EncryptedData` at or below
    /// `element` with the decrypted nodes.
    pub fn do_final(
        &mut self,
        doc: &mut Document,
        element: NodeId,
        content: bool,
        ctx: &Context,
    ) -> Result<NodeId, Error> {
        match self.mode {
            CipherMode::Encrypt => self
                .encrypt_element(doc, element, content)
                .map_err(Error::into_encryption),
            CipherMode::Decrypt => self
                .decrypt_element(doc, element, ctx)
                .map_err(Error::into_encryption),
            x => Err(Error::InvalidState(format!(
                "doFinal is not available in {:?} mode",
                x
            ))),
        }
    }

    /* Encrypt */

    fn encrypt_element(
        &mut self,
        doc: &mut Document,
        element: NodeId,
        content: bool,
    ) -> Result<NodeId, Error> {
        let plain = if content {
            self.serializer.serialize_content(doc, element)?
        } else {
            self.serializer.serialize_element(doc, element)?
        };

        let algorithm = self
            .algorithm
            .clone()
            .ok_or_else(|| Error::InvalidState("no encryption algorithm set".into()))?;
        let cipher_value = self.encrypt_octets(&plain)?;

        let encrypted = self
            .encrypted_data
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no EncryptedData in progress".into()))?;

        encrypted.base.cipher_data.set_value(cipher_value)?;
        encrypted.base.encryption_method = Some(EncryptionMethod::new(&algorithm));
        encrypted.base.set_type(Some(if content {
            ENCRYPTION_TYPE_CONTENT
        } else {
            ENCRYPTION_TYPE_ELEMENT
        }))?;

        let new_element = marshal_encrypted_data(doc, encrypted)?;

        if content {
            doc.remove_children(element);
            doc.append_child(element, new_element)?;
        } else {
            doc.replace_node(element, new_element)?;
        }

        Ok(new_element)
    }

    /// ENCRYPT: encrypts an arbitrary octet stream into the in-progress
    /// `EncryptedData`.
    pub fn encrypt_data(&mut self, data: &[u8]) -> Result<&EncryptedData, Error> {
        self.require_mode(CipherMode::Encrypt, "encryptData")?;

        let algorithm = self
            .algorithm
            .clone()
            .ok_or_else(|| Error::InvalidState("no encryption algorithm set".into()))?;
        let cipher_value = self.encrypt_octets(data).map_err(Error::into_encryption)?;

        let encrypted = self
            .encrypted_data
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no EncryptedData in progress".into()))?;

        encrypted.base.cipher_data.set_value(cipher_value)?;
        encrypted.base.encryption_method = Some(EncryptionMethod::new(&algorithm));

        Ok(&*encrypted)
    }

    /// `Base64( IV || ciphertext )` with a freshly generated IV.
    fn encrypt_octets(&self, plain: &[u8]) -> Result<String, Error> {
        let algorithm = self
            .algorithm
            .as_deref()
            .ok_or_else(|| Error::InvalidState("no encryption algorithm set".into()))?;
        let cipher = Registry::global().lookup_cipher(algorithm)?;

        let key = self
            .key
            .as_ref()
            .ok_or_else(|| Error::KeyResolutionError("no encryption key set".into()))?
            .as_symmetric()?;

        if key.len() != cipher.key_len() {
            return Err(Error::InvalidInput(format!(
                "key length {} does not match cipher '{}'",
                key.len(),
                algorithm
            )));
        }

        let mut iv = vec![0u8; cipher.iv_len()];
        thread_rng().fill(&mut iv[..]);

        let ciphertext = cbc_encrypt(cipher.cipher(), key.bytes(), Some(&iv), plain)?;

        let mut out = iv;
        out.extend_from_slice(&ciphertext);

        Ok(encode(&out))
    }

    /* Decrypt */

    /// DECRYPT: reads the `EncryptedData` at or below `element` into the
    /// cipher.
    pub fn load_encrypted_data(
        &mut self,
        doc: &mut Document,
        element: NodeId,
    ) -> Result<&EncryptedData, Error> {
        self.require_mode(CipherMode::Decrypt, "loadEncryptedData")?;

        let ed_element = locate_encrypted_data(doc, element)?;
        register_ids(doc, ed_element);

        let encrypted = unmarshal_encrypted_data(doc, ed_element)?;

        Ok(&*self.encrypted_data.insert(encrypted))
    }

    fn decrypt_element(
        &mut self,
        doc: &mut Document,
        element: NodeId,
        ctx: &Context,
    ) -> Result<NodeId, Error> {
        let ed_element = locate_encrypted_data(doc, element)?;
        register_ids(doc, ed_element);

        let encrypted = unmarshal_encrypted_data(doc, ed_element)?;
        let plain = self.decrypt_octets(doc, &encrypted, ctx)?;
        let text = from_utf8(&plain)?.to_owned();

        let parent = doc
            .parent(ed_element)
            .ok_or_else(|| Error::InvalidState("EncryptedData has no parent".into()))?;

        // the namespace context comes from the ancestor chain of the
        // replaced element
        let nodes = self.serializer.deserialize(doc, parent, &text)?;

        self.encrypted_data = Some(encrypted);

        if doc.kind(parent) == NodeKind::Document {
            let mut elements = nodes
                .iter()
                .copied()
                .filter(|n| doc.kind(*n) == NodeKind::Element);

            let new_root = elements.next().ok_or_else(|| {
                Error::EncryptionError("decrypted document root is not an element".into())
            })?;
            if elements.next().is_some() {
                return Err(Error::EncryptionError(
                    "decrypted document root must be a single element".into(),
                ));
            }

            doc.replace_node(ed_element, new_root)?;

            Ok(new_root)
        } else {
            for node in nodes {
                doc.insert_before(parent, node, ed_element)?;
            }

            doc.detach(ed_element)?;

            Ok(parent)
        }
    }

    /// DECRYPT: decrypts the `EncryptedData` at or below `element` to raw
    /// octets without touching the document.
    pub fn decrypt_to_byte_array(
        &mut self,
        doc: &Document,
        element: NodeId,
        ctx: &Context,
    ) -> Result<Vec<u8>, Error> {
        self.require_mode(CipherMode::Decrypt, "decryptToByteArray")?;

        let ed_element = locate_encrypted_data(doc, element)?;
        let encrypted = unmarshal_encrypted_data(doc, ed_element)?;

        let plain = self
            .decrypt_octets(doc, &encrypted, ctx)
            .map_err(Error::into_encryption)?;

        self.encrypted_data = Some(encrypted);

        Ok(plain)
    }

    fn decrypt_octets(
        &self,
        doc: &Document,
        encrypted: &EncryptedData,
        ctx: &Context,
    ) -> Result<Vec<u8>, Error> {
        let method = encrypted.base.encryption_method.as_ref().ok_or_else(|| {
            Error::MarshalError("EncryptedData is missing the EncryptionMethod".into())
        })?;
        let cipher = Registry::global().lookup_cipher(&method.algorithm)?;

        let ciphertext = self.ciphertext_octets(doc, encrypted, ctx)?;

        let resolved;
        let key = match &self.key {
            Some(key) => key.as_symmetric()?,
            None => {
                resolved = self.resolve_data_key(doc, encrypted, &method.algorithm, ctx)?;

                resolved.as_symmetric()?
            }
        };

        if ciphertext.len() < cipher.block_size()
            || ciphertext.len() % cipher.block_size() != 0
        {
            return Err(Error::EncryptionError(
                "ciphertext is not a whole number of cipher blocks".into(),
            ));
        }

        // the IV is the leading cipher block of the ciphertext
        let (iv, ciphertext) = ciphertext.split_at(cipher.block_size());

        decrypt_cbc(&cipher, key.bytes(), iv, ciphertext)
    }

    /// Recovers the raw ciphertext: either the Base64 `CipherValue` or a
    /// dereferenced `CipherReference` run through its transforms.
    fn ciphertext_octets(
        &self,
        doc: &Document,
        encrypted: &EncryptedData,
        ctx: &Context,
    ) -> Result<Vec<u8>, Error> {
        if let Some(value) = encrypted.base.cipher_data.value() {
            return Ok(decode(value)?);
        }

        let reference = encrypted.base.cipher_data.reference().ok_or_else(|| {
            Error::MarshalError("CipherData carries neither value nor reference".into())
        })?;

        let request = DereferenceRequest {
            uri: Some(&reference.uri),
            base_uri: ctx.base_uri.as_deref(),
            here: None,
        };

        let data = dereference(doc, &request, ctx)?;

        let mut sink = VecSink::new();
        reference
            .transforms
            .execute(doc, data, &TransformContext::default(), &mut sink)?;

        Ok(sink.into_bytes())
    }

    /// Transient `EncryptedKey` resolution: with a KEK present, every
    /// `EncryptedKey` in the `KeyInfo` is tried in order; failures are
    /// logged and the next entry takes over.
    fn resolve_data_key(
        &self,
        doc: &Document,
        encrypted: &EncryptedData,
        data_algorithm: &str,
        ctx: &Context,
    ) -> Result<Key, Error> {
        if let Some(selector) = &ctx.key_selector {
            if let Some(key) = selector.select(
                encrypted.base.key_info.as_ref(),
                KeyPurpose::Decrypt,
                data_algorithm,
                ctx,
            )? {
                return Ok(key);
            }
        }

        if let Some(key_info) = &encrypted.base.key_info {
            if self.kek.is_some() {
                for encrypted_key in key_info.encrypted_keys() {
                    match self.unwrap_encrypted_key(doc, encrypted_key, Some(data_algorithm)) {
                        Ok(key) => return Ok(key),
                        Err(err) => {
                            warn!("Unable to unwrap EncryptedKey: {}", err);
                        }
                    }
                }
            }
        }

        Err(Error::KeyResolutionError(
            "unable to resolve the decryption key".into(),
        ))
    }

    /* Wrap */

    /// WRAP: wraps `key` with the KEK into the in-progress
    /// `EncryptedKey`. Invoked outside WRAP mode the call still executes,
    /// with a warning.
    pub fn encrypt_key(&mut self, key: &Key) -> Result<&EncryptedKey, Error> {
        if self.mode != CipherMode::Wrap {
            warn!(
                "encryptKey invoked in {:?} mode, expected Wrap; executing anyway",
                self.mode
            );
        }

        let algorithm = self
            .algorithm
            .clone()
            .ok_or_else(|| Error::InvalidState("no key wrap algorithm set".into()))?;
        let wrap_algorithm = Registry::global().lookup_key_wrap(&algorithm)?;

        let kek = self
            .kek
            .as_ref()
            .or(self.key.as_ref())
            .ok_or_else(|| Error::KeyResolutionError("no KEK set".into()))?;

        let encrypted = self
            .encrypted_key
            .get_or_insert_with(|| EncryptedKey::new(CipherData::with_value("")));

        let oaep_params = encrypted
            .base
            .encryption_method
            .as_ref()
            .and_then(|method| method.oaep_params.clone());

        let wrapped = wrap_key_octets(
            kek,
            wrap_algorithm,
            key.as_symmetric()?.bytes(),
            oaep_params.as_deref(),
        )
        .map_err(Error::into_encryption)?;

        encrypted.base.cipher_data.set_value(encode(&wrapped))?;

        let mut method = EncryptionMethod::new(&algorithm);
        method.oaep_params = oaep_params;
        encrypted.base.encryption_method = Some(method);

        Ok(&*encrypted)
    }

    /* Unwrap */

    /// UNWRAP: reads an `EncryptedKey` element into the cipher.
    pub fn load_encrypted_key(
        &mut self,
        doc: &mut Document,
        element: NodeId,
    ) -> Result<&EncryptedKey, Error> {
        self.require_mode(CipherMode::Unwrap, "loadEncryptedKey")?;

        register_ids(doc, element);

        let encrypted = super::unmarshal_encrypted_key(doc, element)?;

        Ok(&*self.encrypted_key.insert(encrypted))
    }

    /// UNWRAP: unwraps the key carried by `encrypted_key`. The requested
    /// algorithm decides the expected key length; when absent it is
    /// inferred by the caller from the enclosing `EncryptedData`.
    pub fn decrypt_key(
        &mut self,
        doc: &Document,
        encrypted_key: &EncryptedKey,
        algorithm: Option<&str>,
    ) -> Result<Key, Error> {
        self.require_mode(CipherMode::Unwrap, "decryptKey")?;

        self.unwrap_encrypted_key(doc, encrypted_key, algorithm)
            .map_err(Error::into_encryption)
    }

    fn unwrap_encrypted_key(
        &self,
        _doc: &Document,
        encrypted_key: &EncryptedKey,
        requested_algorithm: Option<&str>,
    ) -> Result<Key, Error> {
        let method = encrypted_key.base.encryption_method.as_ref().ok_or_else(|| {
            Error::MarshalError("EncryptedKey is missing the EncryptionMethod".into())
        })?;
        let wrap_algorithm = Registry::global().lookup_key_wrap(&method.algorithm)?;

        // an RSA wrap algorithm needs the private key, symmetric wraps
        // the secret KEK
        let kek = self
            .kek
            .as_ref()
            .or(self.key.as_ref())
            .ok_or_else(|| Error::KeyResolutionError("no KEK set".into()))?;

        let value = encrypted_key.base.cipher_data.value().ok_or_else(|| {
            Error::MarshalError("EncryptedKey carries no CipherValue".into())
        })?;
        let wrapped = decode(value)?;

        let bytes = unwrap_key_octets(kek, wrap_algorithm, &wrapped, method.oaep_params.as_deref())?;

        if let Some(uri) = requested_algorithm {
            if let Ok(cipher) = Registry::global().lookup_cipher(uri) {
                if bytes.len() != cipher.key_len() {
                    return Err(Error::KeyResolutionError(format!(
                        "unwrapped key length {} does not match algorithm '{}'",
                        bytes.len(),
                        uri
                    )));
                }
            }
        }

        Ok(Key::Symmetric(SymmetricKey::new(bytes)))
    }
}

/// First `xenc:EncryptedData` at or below `element`.
fn locate_encrypted_data(doc: &Document, element: NodeId) -> Result<NodeId, Error> {
    if doc.is_element_named(element, NODE_ENCRYPTED_DATA, NS_XMLENC) {
        return Ok(element);
    }

    doc.find_element(element, NODE_ENCRYPTED_DATA, NS_XMLENC)
        .ok_or_else(|| {
            Error::MarshalError(format!("no '{}' element found", NODE_ENCRYPTED_DATA))
        })
}

/* Primitives */

pub(crate) fn wrap_key_octets(
    kek: &Key,
    algorithm: KeyWrapAlgorithm,
    data: &[u8],
    oaep_params: Option<&[u8]>,
) -> Result<Vec<u8>, Error> {
    match algorithm {
        KeyWrapAlgorithm::Aes128Kw | KeyWrapAlgorithm::Aes192Kw | KeyWrapAlgorithm::Aes256Kw => {
            let kek = kek.as_symmetric()?;
            check_kek_len(kek, algorithm)?;

            let aes = AesKey::new_encrypt(kek.bytes())
                .map_err(|_| Error::EncryptionError("invalid AES key-wrap KEK".into()))?;

            let mut out = vec![0; data.len() + 8];
            let len = wrap_key(&aes, None, &mut out, data)
                .map_err(|_| Error::EncryptionError("AES key wrap failed".into()))?;
            out.truncate(len);

            Ok(out)
        }
        KeyWrapAlgorithm::TripleDesKw => {
            let kek = kek.as_symmetric()?;
            check_kek_len(kek, algorithm)?;

            triple_des_wrap(kek, data)
        }
        KeyWrapAlgorithm::Rsa15 => rsa_encrypt(kek, Padding::PKCS1, None, data),
        KeyWrapAlgorithm::RsaOaep => rsa_encrypt(kek, Padding::PKCS1_OAEP, oaep_params, data),
    }
}

pub(crate) fn unwrap_key_octets(
    kek: &Key,
    algorithm: KeyWrapAlgorithm,
    data: &[u8],
    oaep_params: Option<&[u8]>,
) -> Result<Vec<u8>, Error> {
    match algorithm {
        KeyWrapAlgorithm::Aes128Kw | KeyWrapAlgorithm::Aes192Kw | KeyWrapAlgorithm::Aes256Kw => {
            let kek = kek.as_symmetric()?;
            check_kek_len(kek, algorithm)?;

            if data.len() < 16 {
                return Err(Error::EncryptionError("wrapped key is too short".into()));
            }

            let aes = AesKey::new_decrypt(kek.bytes())
                .map_err(|_| Error::EncryptionError("invalid AES key-wrap KEK".into()))?;

            let mut out = vec![0; data.len() - 8];
            let len = unwrap_key(&aes, None, &mut out, data)
                .map_err(|_| Error::EncryptionError("AES key unwrap failed".into()))?;
            out.truncate(len);

            Ok(out)
        }
        KeyWrapAlgorithm::TripleDesKw => {
            let kek = kek.as_symmetric()?;
            check_kek_len(kek, algorithm)?;

            triple_des_unwrap(kek, data)
        }
        KeyWrapAlgorithm::Rsa15 => rsa_decrypt(kek, Padding::PKCS1, None, data),
        KeyWrapAlgorithm::RsaOaep => rsa_decrypt(kek, Padding::PKCS1_OAEP, oaep_params, data),
    }
}

fn check_kek_len(kek: &SymmetricKey, algorithm: KeyWrapAlgorithm) -> Result<(), Error> {
    if let Some(expected) = algorithm.kek_len() {
        if kek.len() != expected {
            return Err(Error::InvalidInput(format!(
                "KEK length {} does not match {:?}",
                kek.len(),
                algorithm
            )));
        }
    }

    Ok(())
}

fn rsa_encrypt(
    kek: &Key,
    padding: Padding,
    oaep_label: Option<&[u8]>,
    data: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut encrypter = match kek {
        Key::RsaPublic(pkey) => RsaEncrypter::new(pkey),
        Key::RsaPrivate(pkey) => RsaEncrypter::new(pkey),
        Key::Symmetric(_) => {
            return Err(Error::InvalidInput(
                "RSA key transport requires an RSA key".into(),
            ))
        }
    }?;

    encrypter.set_rsa_padding(padding)?;

    if padding == Padding::PKCS1_OAEP {
        encrypter.set_rsa_oaep_md(MessageDigest::sha1())?;
        encrypter.set_rsa_mgf1_md(MessageDigest::sha1())?;

        if let Some(label) = oaep_label {
            if !label.is_empty() {
                encrypter.set_rsa_oaep_label(label)?;
            }
        }
    }

    let mut out = vec![0; encrypter.encrypt_len(data)?];
    let len = encrypter.encrypt(data, &mut out)?;
    out.truncate(len);

    Ok(out)
}

fn rsa_decrypt(
    kek: &Key,
    padding: Padding,
    oaep_label: Option<&[u8]>,
    data: &[u8],
) -> Result<Vec<u8>, Error> {
    let pkey = match kek {
        Key::RsaPrivate(pkey) => pkey,
        x => {
            return Err(Error::InvalidInput(format!(
                "RSA key transport requires the RSA private key, got a {} key",
                x.kind()
            )))
        }
    };

    let mut decrypter = RsaDecrypter::new(pkey)?;
    decrypter.set_rsa_padding(padding)?;

    if padding == Padding::PKCS1_OAEP {
        decrypter.set_rsa_oaep_md(MessageDigest::sha1())?;
        decrypter.set_rsa_mgf1_md(MessageDigest::sha1())?;

        if let Some(label) = oaep_label {
            if !label.is_empty() {
                decrypter.set_rsa_oaep_label(label)?;
            }
        }
    }

    let mut out = vec![0; decrypter.decrypt_len(data)?];
    let len = decrypter.decrypt(data, &mut out)?;
    out.truncate(len);

    Ok(out)
}

/// RFC 3217 TripleDES key wrap.
fn triple_des_wrap(kek: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, Error> {
    let checksum = hash(MessageDigest::sha1(), data)?;

    let mut wkcks = data.to_vec();
    wkcks.extend_from_slice(&checksum[..8]);

    let mut iv = [0u8; 8];
    thread_rng().fill(&mut iv[..]);

    let temp1 = des_ede3_raw(Mode::Encrypt, kek.bytes(), &iv, &wkcks)?;

    let mut temp2 = iv.to_vec();
    temp2.extend_from_slice(&temp1);
    temp2.reverse();

    des_ede3_raw(Mode::Encrypt, kek.bytes(), &TRIPLE_DES_KW_IV, &temp2)
}

fn triple_des_unwrap(kek: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.len() % 8 != 0 || data.len() < 16 {
        return Err(Error::EncryptionError("wrapped key is malformed".into()));
    }

    let mut temp2 = des_ede3_raw(Mode::Decrypt, kek.bytes(), &TRIPLE_DES_KW_IV, data)?;
    temp2.reverse();

    let (iv, temp1) = temp2.split_at(8);
    let wkcks = des_ede3_raw(Mode::Decrypt, kek.bytes(), iv, temp1)?;

    if wkcks.len() < 8 {
        return Err(Error::EncryptionError("wrapped key is malformed".into()));
    }

    let (key, checksum) = wkcks.split_at(wkcks.len() - 8);
    let expected = hash(MessageDigest::sha1(), key)?;

    if &expected[..8] != checksum {
        return Err(Error::EncryptionError(
            "TripleDES key wrap checksum mismatch".into(),
        ));
    }

    Ok(key.to_vec())
}

fn des_ede3_raw(mode: Mode, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = SymmCipher::des_ede3_cbc();

    let mut crypter = Crypter::new(cipher, mode, key, Some(iv))?;
    crypter.pad(false);

    let mut out = vec![0; data.len() + cipher.block_size()];
    let mut len = crypter.update(data, &mut out)?;
    len += crypter.finalize(&mut out[len..])?;
    out.truncate(len);

    Ok(out)
}

/// CBC decryption with XML Encryption padding: the final octet names the
/// padding length, the padding content itself is arbitrary.
fn decrypt_cbc(
    cipher: &BlockCipher,
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut crypter = Crypter::new(cipher.cipher(), Mode::Decrypt, key, Some(iv))?;
    crypter.pad(false);

    let mut out = vec![0; ciphertext.len() + cipher.block_size()];
    let mut len = crypter.update(ciphertext, &mut out)?;
    len += crypter.finalize(&mut out[len..])?;
    out.truncate(len);

    let pad = *out
        .last()
        .ok_or_else(|| Error::EncryptionError("decrypted payload is empty".into()))?
        as usize;

    if pad == 0 || pad > cipher.block_size() || pad > out.len() {
        return Err(Error::EncryptionError("invalid block padding".into()));
    }

    out.truncate(out.len() - pad);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;

    use crate::{
        CIPHER_AES128, KEYTRANSPORT_RSA_1_5, KEYTRANSPORT_RSA_OAEP, KEYWRAP_AES192,
        KEYWRAP_TRIPLEDES,
    };

    #[test]
    fn aes_key_wrap_round_trip() {
        let kek = Key::symmetric(&b"abcdefghijklmnopqrstuvwx"[..]);
        let data = (0x10..0x20).collect::<Vec<u8>>();

        let wrapped = wrap_key_octets(&kek, KeyWrapAlgorithm::Aes192Kw, &data, None).unwrap();
        assert_eq!(wrapped.len(), data.len() + 8);

        let unwrapped =
            unwrap_key_octets(&kek, KeyWrapAlgorithm::Aes192Kw, &wrapped, None).unwrap();
        assert_eq!(unwrapped, data);
    }

    #[test]
    fn aes_key_wrap_rejects_wrong_kek_length() {
        let kek = Key::symmetric(&b"short"[..]);
        let data = vec![0u8; 16];

        match wrap_key_octets(&kek, KeyWrapAlgorithm::Aes128Kw, &data, None) {
            Err(Error::InvalidInput(_)) => (),
            x => panic!("unexpected result: {:?}", x),
        }
    }

    #[test]
    fn triple_des_key_wrap_round_trip() {
        let kek = Key::symmetric(&b"abcdefghijklmnopqrstuvwx"[..]);
        let data = vec![0x42u8; 24];

        let wrapped = wrap_key_octets(&kek, KeyWrapAlgorithm::TripleDesKw, &data, None).unwrap();
        let unwrapped =
            unwrap_key_octets(&kek, KeyWrapAlgorithm::TripleDesKw, &wrapped, None).unwrap();

        assert_eq!(unwrapped, data);
    }

    #[test]
    fn triple_des_key_wrap_detects_tampering() {
        let kek = Key::symmetric(&b"abcdefghijklmnopqrstuvwx"[..]);
        let data = vec![0x42u8; 24];

        let mut wrapped =
            wrap_key_octets(&kek, KeyWrapAlgorithm::TripleDesKw, &data, None).unwrap();
        wrapped[3] ^= 0xff;

        assert!(unwrap_key_octets(&kek, KeyWrapAlgorithm::TripleDesKw, &wrapped, None).is_err());
    }

    #[test]
    fn rsa_key_transport_round_trip() {
        let rsa = Rsa::generate(2048).unwrap();
        let private = Key::RsaPrivate(PKey::from_rsa(rsa).unwrap());
        let data = vec![0x11u8; 16];

        for algorithm in &[KeyWrapAlgorithm::Rsa15, KeyWrapAlgorithm::RsaOaep] {
            let wrapped = wrap_key_octets(&private, *algorithm, &data, None).unwrap();
            let unwrapped = unwrap_key_octets(&private, *algorithm, &wrapped, None).unwrap();

            assert_eq!(unwrapped, data, "{:?}", algorithm);
        }
    }

    #[test]
    fn mode_gating() {
        let mut cipher = XmlCipher::new(Some(CIPHER_AES128)).unwrap();
        let doc = "<a/>".parse::<Document>().unwrap();
        let ctx = Context::new();

        // unset mode refuses everything
        match cipher.encrypt_data(b"data") {
            Err(Error::InvalidState(_)) => (),
            x => panic!("unexpected result: {:?}", x),
        }

        cipher
            .init(CipherMode::Encrypt, Some(Key::symmetric(vec![0u8; 16])))
            .unwrap();

        match cipher.decrypt_to_byte_array(&doc, doc.root(), &ctx) {
            Err(Error::InvalidState(_)) => (),
            x => panic!("unexpected result: {:?}", x),
        }
    }

    #[test]
    fn init_clears_in_progress_objects() {
        let mut cipher = XmlCipher::new(Some(CIPHER_AES128)).unwrap();

        cipher
            .init(CipherMode::Encrypt, Some(Key::symmetric(vec![0u8; 16])))
            .unwrap();
        cipher.encrypt_data(b"payload").unwrap();
        assert!(cipher.get_encrypted_data().is_some());

        cipher.init(CipherMode::Decrypt, None).unwrap();
        assert!(cipher.get_encrypted_data().is_none());
        assert!(cipher.get_encrypted_key().is_none());
    }

    #[test]
    fn encrypt_key_outside_wrap_mode_still_executes() {
        let mut cipher = XmlCipher::new(Some(KEYWRAP_AES192)).unwrap();

        cipher
            .init(CipherMode::Encrypt, Some(Key::symmetric(vec![0u8; 16])))
            .unwrap();
        cipher.set_kek(Key::symmetric(&b"abcdefghijklmnopqrstuvwx"[..]));

        let data_key = Key::symmetric(vec![0x21u8; 16]);
        let encrypted_key = cipher.encrypt_key(&data_key).unwrap();

        assert!(encrypted_key.base.cipher_data.value().is_some());
    }

    #[test]
    fn wrap_unwrap_through_cipher() {
        let kek_bytes = b"abcdefghijklmnopqrstuvwx";
        let doc = "<a/>".parse::<Document>().unwrap();

        let mut wrapper = XmlCipher::new(Some(KEYWRAP_AES192)).unwrap();
        wrapper
            .init(CipherMode::Wrap, Some(Key::symmetric(&kek_bytes[..])))
            .unwrap();

        let data_key_bytes: Vec<u8> = (0x10..0x20).collect();
        wrapper
            .encrypt_key(&Key::symmetric(data_key_bytes.clone()))
            .unwrap();
        let encrypted_key = wrapper.take_encrypted_key().unwrap();

        let mut unwrapper = XmlCipher::new(None).unwrap();
        unwrapper
            .init(CipherMode::Unwrap, Some(Key::symmetric(&kek_bytes[..])))
            .unwrap();

        let key = unwrapper
            .decrypt_key(&doc, &encrypted_key, Some(CIPHER_AES128))
            .unwrap();

        assert_eq!(key.as_symmetric().unwrap().bytes(), &data_key_bytes[..]);
    }

    #[test]
    fn unwrap_checks_requested_key_length() {
        let kek = b"abcdefghijklmnopqrstuvwx";
        let doc = "<a/>".parse::<Document>().unwrap();

        let mut wrapper = XmlCipher::new(Some(KEYWRAP_TRIPLEDES)).unwrap();
        wrapper
            .init(CipherMode::Wrap, Some(Key::symmetric(&kek[..])))
            .unwrap();
        wrapper.encrypt_key(&Key::symmetric(vec![0x42u8; 24])).unwrap();
        let encrypted_key = wrapper.take_encrypted_key().unwrap();

        let mut unwrapper = XmlCipher::new(None).unwrap();
        unwrapper
            .init(CipherMode::Unwrap, Some(Key::symmetric(&kek[..])))
            .unwrap();

        // a 24 byte key does not satisfy AES-128
        match unwrapper.decrypt_key(&doc, &encrypted_key, Some(CIPHER_AES128)) {
            Err(Error::KeyResolutionError(_)) => (),
            x => panic!("unexpected result: {:?}", x),
        }
    }

    #[test]
    fn rsa_oaep_label_round_trip() {
        let rsa = Rsa::generate(2048).unwrap();
        let key = Key::RsaPrivate(PKey::from_rsa(rsa).unwrap());
        let data = vec![0x77u8; 16];
        let label = b"params";

        let wrapped =
            wrap_key_octets(&key, KeyWrapAlgorithm::RsaOaep, &data, Some(label)).unwrap();
        let unwrapped =
            unwrap_key_octets(&key, KeyWrapAlgorithm::RsaOaep, &wrapped, Some(label)).unwrap();
        assert_eq!(unwrapped, data);

        // wrong label fails
        assert!(
            unwrap_key_octets(&key, KeyWrapAlgorithm::RsaOaep, &wrapped, Some(b"other")).is_err()
        );
    }

    #[test]
    fn algorithm_is_validated_at_construction() {
        match XmlCipher::new(Some("urn:nonsense")) {
            Err(Error::AlgorithmUnsupported(_)) => (),
            _ => panic!("unexpected result"),
        }

        let _ = XmlCipher::new(Some(KEYTRANSPORT_RSA_1_5)).unwrap();
        let _ = XmlCipher::new(Some(KEYTRANSPORT_RSA_OAEP)).unwrap();
    }
}
