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

use crate::dereference::validate_uri_reference;
use crate::signature::KeyInfo;
use crate::transform::TransformChain;
use crate::Error;

/// `EncryptionMethod`: algorithm URI plus optional key size and OAEP
/// parameters.
#[derive(Debug, Default, PartialEq)]
pub struct EncryptionMethod {
    pub algorithm: String,
    pub key_size: Option<usize>,
    pub oaep_params: Option<Vec<u8>>,
}

impl EncryptionMethod {
    pub fn new<T: Into<String>>(algorithm: T) -> Self {
        Self {
            algorithm: algorithm.into(),
            key_size: None,
            oaep_params: None,
        }
    }
}

/// `CipherData`: exactly one of `CipherValue` or `CipherReference`.
/// Setting the other arm once one is populated is rejected.
#[derive(Debug, Default, PartialEq)]
pub struct CipherData {
    value: Option<String>,
    reference: Option<CipherReference>,
}

impl CipherData {
    /// Placeholder with neither arm set; marshaling requires one of the
    /// setters to have run.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_value<T: Into<String>>(value: T) -> Self {
        Self {
            value: Some(value.into()),
            reference: None,
        }
    }

    pub fn with_reference(reference: CipherReference) -> Self {
        Self {
            value: None,
            reference: Some(reference),
        }
    }

    pub fn set_value<T: Into<String>>(&mut self, value: T) -> Result<(), Error> {
        if self.reference.is_some() {
            return Err(Error::InvalidState(
                "CipherData already carries a CipherReference".into(),
            ));
        }

        self.value = Some(value.into());

        Ok(())
    }

    pub fn set_reference(&mut self, reference: CipherReference) -> Result<(), Error> {
        if self.value.is_some() {
            return Err(Error::InvalidState(
                "CipherData already carries a CipherValue".into(),
            ));
        }

        self.reference = Some(reference);

        Ok(())
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn reference(&self) -> Option<&CipherReference> {
        self.reference.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.reference.is_none()
    }
}

/// `CipherReference`: URI of the ciphertext plus the transforms that
/// recover the octets.
#[derive(Debug, Default, PartialEq)]
pub struct CipherReference {
    pub uri: String,
    pub transforms: TransformChain,
}

impl CipherReference {
    pub fn new<T: Into<String>>(uri: T) -> Self {
        Self {
            uri: uri.into(),
            transforms: TransformChain::new(),
        }
    }
}

/// Kind of the entries of a `ReferenceList`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Data,
    Key,
}

/// Homogeneous list of `DataReference` or `KeyReference` URIs.
#[derive(Debug, Default, PartialEq)]
pub struct ReferenceList {
    kind: Option<ReferenceKind>,
    uris: Vec<String>,
}

impl ReferenceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data_reference<T: Into<String>>(&mut self, uri: T) -> Result<(), Error> {
        self.add(ReferenceKind::Data, uri.into())
    }

    pub fn add_key_reference<T: Into<String>>(&mut self, uri: T) -> Result<(), Error> {
        self.add(ReferenceKind::Key, uri.into())
    }

    fn add(&mut self, kind: ReferenceKind, uri: String) -> Result<(), Error> {
        match self.kind {
            Some(existing) if existing != kind => {
                return Err(Error::InvalidInput(format!(
                    "ReferenceList holds {:?} references, rejecting a {:?} reference",
                    existing, kind
                )))
            }
            _ => self.kind = Some(kind),
        }

        self.uris.push(uri);

        Ok(())
    }

    pub fn kind(&self) -> Option<ReferenceKind> {
        self.kind
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }
}

/// `EncryptionProperties` and its entries.
#[derive(Debug, Default, PartialEq)]
pub struct EncryptionProperties {
    pub id: Option<String>,
    pub properties: Vec<EncryptionProperty>,
}

#[derive(Debug, Default, PartialEq)]
pub struct EncryptionProperty {
    pub id: Option<String>,
    pub target: Option<String>,
    pub content: String,
}

/// Common record of `EncryptedData` and `EncryptedKey`.
#[derive(Debug, Default, PartialEq)]
pub struct EncryptedType {
    pub id: Option<String>,
    type_: Option<String>,
    pub mime_type: Option<String>,
    encoding: Option<String>,
    pub encryption_method: Option<EncryptionMethod>,
    pub key_info: Option<KeyInfo>,
    pub cipher_data: CipherData,
    pub encryption_properties: Option<EncryptionProperties>,
}

impl EncryptedType {
    pub fn new(cipher_data: CipherData) -> Self {
        Self {
            cipher_data,
            ..Self::default()
        }
    }

    /// Sets the `Type` attribute; non-empty values must be URIs.
    pub fn set_type(&mut self, type_: Option<&str>) -> Result<(), Error> {
        if let Some(type_) = type_ {
            if !type_.is_empty() {
                validate_uri_reference(type_)?;
            }
        }

        self.type_ = type_.map(Into::into);

        Ok(())
    }

    pub fn type_(&self) -> Option<&str> {
        self.type_.as_deref()
    }

    /// Sets the `Encoding` attribute; non-empty values must be URIs.
    pub fn set_encoding(&mut self, encoding: Option<&str>) -> Result<(), Error> {
        if let Some(encoding) = encoding {
            if !encoding.is_empty() {
                validate_uri_reference(encoding)?;
            }
        }

        self.encoding = encoding.map(Into::into);

        Ok(())
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    /// Unmarshal path: attributes are copied verbatim.
    pub(crate) fn set_type_verbatim(&mut self, type_: Option<String>) {
        self.type_ = type_;
    }

    pub(crate) fn set_encoding_verbatim(&mut self, encoding: Option<String>) {
        self.encoding = encoding;
    }
}

/// `EncryptedData` element form.
#[derive(Debug, Default, PartialEq)]
pub struct EncryptedData {
    pub base: EncryptedType,
}

impl EncryptedData {
    pub fn new(cipher_data: CipherData) -> Self {
        Self {
            base: EncryptedType::new(cipher_data),
        }
    }
}

/// `EncryptedKey` element form.
#[derive(Debug, Default, PartialEq)]
pub struct EncryptedKey {
    pub base: EncryptedType,
    pub recipient: Option<String>,
    pub reference_list: Option<ReferenceList>,
    pub carried_key_name: Option<String>,
}

impl EncryptedKey {
    pub fn new(cipher_data: CipherData) -> Self {
        Self {
            base: EncryptedType::new(cipher_data),
            recipient: None,
            reference_list: None,
            carried_key_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_data_arms_are_exclusive() {
        let mut data = CipherData::with_value("AAAA");
        match data.set_reference(CipherReference::new("#ct")) {
            Err(Error::InvalidState(_)) => (),
            x => panic!("unexpected result: {:?}", x),
        }

        let mut data = CipherData::with_reference(CipherReference::new("#ct"));
        match data.set_value("AAAA") {
            Err(Error::InvalidState(_)) => (),
            x => panic!("unexpected result: {:?}", x),
        }
    }

    #[test]
    fn cipher_value_can_be_replaced() {
        let mut data = CipherData::with_value("AAAA");
        data.set_value("BBBB").unwrap();

        assert_eq!(data.value(), Some("BBBB"));
    }

    #[test]
    fn reference_list_is_homogeneous() {
        let mut list = ReferenceList::new();
        list.add_data_reference("#a").unwrap();
        list.add_data_reference("#b").unwrap();

        match list.add_key_reference("#c") {
            Err(Error::InvalidInput(_)) => (),
            x => panic!("unexpected result: {:?}", x),
        }

        assert_eq!(list.kind(), Some(ReferenceKind::Data));
        assert_eq!(list.uris().len(), 2);
    }

    #[test]
    fn type_requires_uri_syntax() {
        let mut et = EncryptedType::default();

        assert!(et.set_type(Some("http://www.w3.org/2001/04/xmlenc#Element")).is_ok());
        assert!(et.set_type(Some("not a uri")).is_err());
        assert!(et.set_type(None).is_ok());
    }
}
