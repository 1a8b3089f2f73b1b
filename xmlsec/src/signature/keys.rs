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

use base64::decode;
use log::warn;
use openssl::bn::BigNum;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::X509;
use xmldom::{Document, NodeId};

use crate::encryption::{marshal_encrypted_key, unmarshal_encrypted_key, EncryptedKey};
use crate::{Context, Error, Key, NS_XMLDSIG, NS_XMLENC};

pub const NODE_KEY_INFO: &str = "KeyInfo";
pub const NODE_KEY_NAME: &str = "KeyName";
pub const NODE_KEY_VALUE: &str = "KeyValue";
pub const NODE_RSA_KEY_VALUE: &str = "RSAKeyValue";
pub const NODE_MODULUS: &str = "Modulus";
pub const NODE_EXPONENT: &str = "Exponent";
pub const NODE_X509_DATA: &str = "X509Data";
pub const NODE_X509_CERTIFICATE: &str = "X509Certificate";
pub const NODE_ENCRYPTED_KEY: &str = "EncryptedKey";

/// In-memory `KeyInfo`: an ordered list of hints a resolver walks through.
#[derive(Debug, Default, PartialEq)]
pub struct KeyInfo {
    pub id: Option<String>,
    pub entries: Vec<KeyInfoEntry>,
}

#[derive(Debug, PartialEq)]
pub enum KeyInfoEntry {
    KeyName(String),
    KeyValue(RsaKeyValue),
    /// Base64 encoded DER certificate.
    X509Certificate(String),
    EncryptedKey(EncryptedKey),
}

#[derive(Debug, PartialEq)]
pub struct RsaKeyValue {
    pub modulus: String,
    pub exponent: String,
}

impl KeyInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encrypted_keys(&self) -> impl Iterator<Item = &EncryptedKey> {
        self.entries.iter().filter_map(|entry| match entry {
            KeyInfoEntry::EncryptedKey(key) => Some(key),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    Verify,
    Decrypt,
}

/// Selects the verification or decryption key for a `KeyInfo`. Trust
/// decisions live behind this trait, not in the engine.
pub trait KeySelector {
    fn select(
        &self,
        key_info: Option<&KeyInfo>,
        purpose: KeyPurpose,
        algorithm: &str,
        ctx: &Context,
    ) -> Result<Option<Key>, Error>;
}

/// Walks the `KeyInfo` entries and derives a public verification key.
/// Entries that fail to parse are logged and skipped; the next resolver
/// takes over.
pub fn resolve_verification_key(key_info: &KeyInfo) -> Option<Key> {
    for entry in &key_info.entries {
        match entry {
            KeyInfoEntry::X509Certificate(cert) => match certificate_key(cert) {
                Ok(key) => return Some(key),
                Err(err) => {
                    warn!("Unable to extract key from X509Certificate: {}", err);
                }
            },
            KeyInfoEntry::KeyValue(value) => match rsa_key(value) {
                Ok(key) => return Some(key),
                Err(err) => {
                    warn!("Unable to build key from RSAKeyValue: {}", err);
                }
            },
            _ => (),
        }
    }

    None
}

fn certificate_key(cert: &str) -> Result<Key, Error> {
    let pem = format!(
        "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----",
        cert.trim()
    );
    let cert = X509::from_pem(pem.as_bytes())?;

    Ok(Key::RsaPublic(cert.public_key()?))
}

fn rsa_key(value: &RsaKeyValue) -> Result<Key, Error> {
    let modulus: String = value.modulus.split_whitespace().collect();
    let exponent: String = value.exponent.split_whitespace().collect();

    let n = BigNum::from_slice(&decode(&modulus)?)?;
    let e = BigNum::from_slice(&decode(&exponent)?)?;

    let rsa = Rsa::from_public_components(n, e)?;

    Ok(Key::RsaPublic(PKey::from_rsa(rsa)?))
}

/// Reads a `ds:KeyInfo` element.
pub fn unmarshal_key_info(doc: &Document, element: NodeId) -> Result<KeyInfo, Error> {
    let mut key_info = KeyInfo {
        id: doc.prop(element, "Id").map(Into::into),
        entries: Vec::new(),
    };

    let mut child = doc.first_child(element).and_then(|n| doc.next_element(n));
    while let Some(entry) = child {
        child = doc.next_sibling(entry).and_then(|n| doc.next_element(n));

        let name = doc.name(entry).unwrap_or_default();
        let ns = doc.ns_href(entry).unwrap_or_default();

        match (name, ns.as_str()) {
            (NODE_KEY_NAME, NS_XMLDSIG) => {
                key_info
                    .entries
                    .push(KeyInfoEntry::KeyName(doc.content(entry)));
            }
            (NODE_KEY_VALUE, NS_XMLDSIG) => {
                if let Some(rsa) = doc.find_element(entry, NODE_RSA_KEY_VALUE, NS_XMLDSIG) {
                    let modulus = doc
                        .find_element(rsa, NODE_MODULUS, NS_XMLDSIG)
                        .map(|n| doc.content(n))
                        .ok_or_else(|| {
                            Error::MarshalError(format!("'{}' is missing", NODE_MODULUS))
                        })?;
                    let exponent = doc
                        .find_element(rsa, NODE_EXPONENT, NS_XMLDSIG)
                        .map(|n| doc.content(n))
                        .ok_or_else(|| {
                            Error::MarshalError(format!("'{}' is missing", NODE_EXPONENT))
                        })?;

                    key_info
                        .entries
                        .push(KeyInfoEntry::KeyValue(RsaKeyValue { modulus, exponent }));
                }
            }
            (NODE_X509_DATA, NS_XMLDSIG) => {
                let mut data_child = doc.first_child(entry).and_then(|n| doc.next_element(n));
                while let Some(data) = data_child {
                    if doc.is_element_named(data, NODE_X509_CERTIFICATE, NS_XMLDSIG) {
                        key_info
                            .entries
                            .push(KeyInfoEntry::X509Certificate(doc.content(data)));
                    }

                    data_child = doc.next_sibling(data).and_then(|n| doc.next_element(n));
                }
            }
            (NODE_ENCRYPTED_KEY, NS_XMLENC) => {
                key_info
                    .entries
                    .push(KeyInfoEntry::EncryptedKey(unmarshal_encrypted_key(
                        doc, entry,
                    )?));
            }
            (name, _) => {
                log::debug!("Ignoring unsupported KeyInfo entry '{}'", name);
            }
        }
    }

    Ok(key_info)
}

/// Emits a `ds:KeyInfo` element. The element is returned detached.
pub fn marshal_key_info(
    doc: &mut Document,
    key_info: &KeyInfo,
    prefix: Option<&str>,
) -> Result<NodeId, Error> {
    let element = create_element(doc, NODE_KEY_INFO, prefix);
    doc.set_ns_decl(element, prefix, NS_XMLDSIG)?;

    if let Some(id) = &key_info.id {
        doc.set_attr(element, "Id", id)?;
    }

    for entry in &key_info.entries {
        match entry {
            KeyInfoEntry::KeyName(name) => {
                let child = create_element(doc, NODE_KEY_NAME, prefix);
                let text = doc.create_text(name);
                doc.append_child(child, text)?;
                doc.append_child(element, child)?;
            }
            KeyInfoEntry::KeyValue(value) => {
                let key_value = create_element(doc, NODE_KEY_VALUE, prefix);
                let rsa = create_element(doc, NODE_RSA_KEY_VALUE, prefix);
                let modulus = create_element(doc, NODE_MODULUS, prefix);
                let exponent = create_element(doc, NODE_EXPONENT, prefix);

                let text = doc.create_text(&value.modulus);
                doc.append_child(modulus, text)?;
                let text = doc.create_text(&value.exponent);
                doc.append_child(exponent, text)?;

                doc.append_child(rsa, modulus)?;
                doc.append_child(rsa, exponent)?;
                doc.append_child(key_value, rsa)?;
                doc.append_child(element, key_value)?;
            }
            KeyInfoEntry::X509Certificate(cert) => {
                let data = create_element(doc, NODE_X509_DATA, prefix);
                let certificate = create_element(doc, NODE_X509_CERTIFICATE, prefix);

                let text = doc.create_text(cert);
                doc.append_child(certificate, text)?;
                doc.append_child(data, certificate)?;
                doc.append_child(element, data)?;
            }
            KeyInfoEntry::EncryptedKey(key) => {
                let child = marshal_encrypted_key(doc, key)?;
                doc.append_child(element, child)?;
            }
        }
    }

    Ok(element)
}

fn create_element(doc: &mut Document, name: &str, prefix: Option<&str>) -> NodeId {
    match prefix {
        Some(prefix) => doc.create_element(&format!("{}:{}", prefix, name)),
        None => doc.create_element(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_round_trip() {
        let mut key_info = KeyInfo::new();
        key_info.entries.push(KeyInfoEntry::KeyValue(RsaKeyValue {
            modulus: "AQAB".into(),
            exponent: "AQAB".into(),
        }));
        key_info.entries.push(KeyInfoEntry::KeyName("test".into()));

        let mut doc = "<root/>".parse::<Document>().unwrap();
        let root = doc.document_element().unwrap();
        let element = marshal_key_info(&mut doc, &key_info, Some("ds")).unwrap();
        doc.append_child(root, element).unwrap();

        let parsed = unmarshal_key_info(&doc, element).unwrap();
        assert_eq!(parsed.entries.len(), 2);

        match &parsed.entries[0] {
            KeyInfoEntry::KeyValue(value) => {
                assert_eq!(value.modulus, "AQAB");
                assert_eq!(value.exponent, "AQAB");
            }
            x => panic!("unexpected entry: {:?}", x),
        }

        match &parsed.entries[1] {
            KeyInfoEntry::KeyName(name) => assert_eq!(name, "test"),
            x => panic!("unexpected entry: {:?}", x),
        }
    }

    #[test]
    fn rsa_key_from_generated_components() {
        let rsa = Rsa::generate(2048).unwrap();
        let value = RsaKeyValue {
            modulus: base64::encode(rsa.n().to_vec()),
            exponent: base64::encode(rsa.e().to_vec()),
        };

        let key = rsa_key(&value).unwrap();
        match key {
            Key::RsaPublic(_) => (),
            x => panic!("unexpected key: {:?}", x),
        }
    }
}
