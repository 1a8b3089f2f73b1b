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

use base64::{decode, encode};
use xmldom::{Document, NodeId, NodeKind};

use crate::signature::{marshal_key_info, unmarshal_key_info, NODE_KEY_INFO};
use crate::transform::{TransformChain, PROP_ALGORITHM};
use crate::{Error, NS_XMLDSIG, NS_XMLENC};

use super::{
    CipherData, CipherReference, EncryptedData, EncryptedKey, EncryptedType, EncryptionMethod,
    EncryptionProperties, EncryptionProperty, ReferenceList,
};

pub const NODE_ENCRYPTED_DATA: &str = "EncryptedData";
pub const NODE_ENCRYPTED_KEY: &str = "EncryptedKey";
pub const NODE_ENCRYPTION_METHOD: &str = "EncryptionMethod";
pub const NODE_KEY_SIZE: &str = "KeySize";
pub const NODE_OAEP_PARAMS: &str = "OAEPparams";
pub const NODE_CIPHER_DATA: &str = "CipherData";
pub const NODE_CIPHER_VALUE: &str = "CipherValue";
pub const NODE_CIPHER_REFERENCE: &str = "CipherReference";
pub const NODE_TRANSFORMS: &str = "Transforms";
pub const NODE_ENCRYPTION_PROPERTIES: &str = "EncryptionProperties";
pub const NODE_ENCRYPTION_PROPERTY: &str = "EncryptionProperty";
pub const NODE_REFERENCE_LIST: &str = "ReferenceList";
pub const NODE_DATA_REFERENCE: &str = "DataReference";
pub const NODE_KEY_REFERENCE: &str = "KeyReference";
pub const NODE_CARRIED_KEY_NAME: &str = "CarriedKeyName";

pub const PROP_ID: &str = "Id";
pub const PROP_TYPE: &str = "Type";
pub const PROP_MIME_TYPE: &str = "MimeType";
pub const PROP_ENCODING: &str = "Encoding";
pub const PROP_RECIPIENT: &str = "Recipient";
pub const PROP_URI: &str = "URI";
pub const PROP_TARGET: &str = "Target";

const PREFIX_XENC: &str = "xenc";
const PREFIX_DS: &str = "ds";

/* Object to element */

/// Emits a detached `xenc:EncryptedData` element in schema order.
pub fn marshal_encrypted_data(
    doc: &mut Document,
    encrypted_data: &EncryptedData,
) -> Result<NodeId, Error> {
    let element = create_xenc_element(doc, NODE_ENCRYPTED_DATA);
    doc.set_ns_decl(element, Some(PREFIX_XENC), NS_XMLENC)?;

    marshal_encrypted_type(doc, element, &encrypted_data.base)?;

    Ok(element)
}

/// Emits a detached `xenc:EncryptedKey` element in schema order.
pub fn marshal_encrypted_key(
    doc: &mut Document,
    encrypted_key: &EncryptedKey,
) -> Result<NodeId, Error> {
    let element = create_xenc_element(doc, NODE_ENCRYPTED_KEY);
    doc.set_ns_decl(element, Some(PREFIX_XENC), NS_XMLENC)?;

    if let Some(recipient) = &encrypted_key.recipient {
        doc.set_attr(element, PROP_RECIPIENT, recipient)?;
    }

    marshal_encrypted_type(doc, element, &encrypted_key.base)?;

    if let Some(list) = &encrypted_key.reference_list {
        let child = marshal_reference_list(doc, list)?;
        doc.append_child(element, child)?;
    }

    if let Some(name) = &encrypted_key.carried_key_name {
        let child = create_xenc_element(doc, NODE_CARRIED_KEY_NAME);
        let text = doc.create_text(name);
        doc.append_child(child, text)?;
        doc.append_child(element, child)?;
    }

    Ok(element)
}

fn marshal_encrypted_type(
    doc: &mut Document,
    element: NodeId,
    encrypted: &EncryptedType,
) -> Result<(), Error> {
    if let Some(id) = &encrypted.id {
        doc.set_attr(element, PROP_ID, id)?;
        doc.register_id(id, element);
    }

    if let Some(type_) = encrypted.type_() {
        doc.set_attr(element, PROP_TYPE, type_)?;
    }

    if let Some(mime_type) = &encrypted.mime_type {
        doc.set_attr(element, PROP_MIME_TYPE, mime_type)?;
    }

    if let Some(encoding) = encrypted.encoding() {
        doc.set_attr(element, PROP_ENCODING, encoding)?;
    }

    if let Some(method) = &encrypted.encryption_method {
        let child = marshal_encryption_method(doc, method)?;
        doc.append_child(element, child)?;
    }

    if let Some(key_info) = &encrypted.key_info {
        let child = marshal_key_info(doc, key_info, Some(PREFIX_DS))?;
        doc.append_child(element, child)?;
    }

    let child = marshal_cipher_data(doc, &encrypted.cipher_data)?;
    doc.append_child(element, child)?;

    if let Some(properties) = &encrypted.encryption_properties {
        let child = marshal_encryption_properties(doc, properties)?;
        doc.append_child(element, child)?;
    }

    Ok(())
}

fn marshal_encryption_method(
    doc: &mut Document,
    method: &EncryptionMethod,
) -> Result<NodeId, Error> {
    let element = create_xenc_element(doc, NODE_ENCRYPTION_METHOD);
    doc.set_attr(element, PROP_ALGORITHM, &method.algorithm)?;

    if let Some(key_size) = method.key_size {
        let child = create_xenc_element(doc, NODE_KEY_SIZE);
        let text = doc.create_text(&key_size.to_string());
        doc.append_child(child, text)?;
        doc.append_child(element, child)?;
    }

    if let Some(params) = &method.oaep_params {
        let child = create_xenc_element(doc, NODE_OAEP_PARAMS);
        let text = doc.create_text(&encode(params));
        doc.append_child(child, text)?;
        doc.append_child(element, child)?;
    }

    Ok(element)
}

fn marshal_cipher_data(doc: &mut Document, cipher_data: &CipherData) -> Result<NodeId, Error> {
    let element = create_xenc_element(doc, NODE_CIPHER_DATA);

    if let Some(value) = cipher_data.value() {
        let child = create_xenc_element(doc, NODE_CIPHER_VALUE);
        let text = doc.create_text(value);
        doc.append_child(child, text)?;
        doc.append_child(element, child)?;
    } else if let Some(reference) = cipher_data.reference() {
        let child = create_xenc_element(doc, NODE_CIPHER_REFERENCE);
        doc.set_attr(child, PROP_URI, &reference.uri)?;

        if !reference.transforms.is_empty() {
            let transforms = create_xenc_element(doc, NODE_TRANSFORMS);
            doc.set_ns_decl(transforms, Some(PREFIX_DS), NS_XMLDSIG)?;
            reference
                .transforms
                .marshal_into(doc, transforms, Some(PREFIX_DS))?;
            doc.append_child(child, transforms)?;
        }

        doc.append_child(element, child)?;
    } else {
        return Err(Error::MarshalError(
            "CipherData carries neither a CipherValue nor a CipherReference".into(),
        ));
    }

    Ok(element)
}

fn marshal_encryption_properties(
    doc: &mut Document,
    properties: &EncryptionProperties,
) -> Result<NodeId, Error> {
    let element = create_xenc_element(doc, NODE_ENCRYPTION_PROPERTIES);

    if let Some(id) = &properties.id {
        doc.set_attr(element, PROP_ID, id)?;
        doc.register_id(id, element);
    }

    for property in &properties.properties {
        let child = create_xenc_element(doc, NODE_ENCRYPTION_PROPERTY);

        if let Some(id) = &property.id {
            doc.set_attr(child, PROP_ID, id)?;
            doc.register_id(id, child);
        }

        if let Some(target) = &property.target {
            doc.set_attr(child, PROP_TARGET, target)?;
        }

        let text = doc.create_text(&property.content);
        doc.append_child(child, text)?;
        doc.append_child(element, child)?;
    }

    Ok(element)
}

fn marshal_reference_list(doc: &mut Document, list: &ReferenceList) -> Result<NodeId, Error> {
    let element = create_xenc_element(doc, NODE_REFERENCE_LIST);

    let name = match list.kind() {
        Some(super::ReferenceKind::Data) | None => NODE_DATA_REFERENCE,
        Some(super::ReferenceKind::Key) => NODE_KEY_REFERENCE,
    };

    for uri in list.uris() {
        let child = create_xenc_element(doc, name);
        doc.set_attr(child, PROP_URI, uri)?;
        doc.append_child(element, child)?;
    }

    Ok(element)
}

fn create_xenc_element(doc: &mut Document, name: &str) -> NodeId {
    doc.create_element(&format!("{}:{}", PREFIX_XENC, name))
}

/* Element to object */

/// Reads an `xenc:EncryptedData` element.
pub fn unmarshal_encrypted_data(doc: &Document, element: NodeId) -> Result<EncryptedData, Error> {
    if !doc.is_element_named(element, NODE_ENCRYPTED_DATA, NS_XMLENC) {
        return Err(Error::MarshalError(format!(
            "expected element '{}'",
            NODE_ENCRYPTED_DATA
        )));
    }

    Ok(EncryptedData {
        base: unmarshal_encrypted_type(doc, element)?,
    })
}

/// Reads an `xenc:EncryptedKey` element.
pub fn unmarshal_encrypted_key(doc: &Document, element: NodeId) -> Result<EncryptedKey, Error> {
    if !doc.is_element_named(element, NODE_ENCRYPTED_KEY, NS_XMLENC) {
        return Err(Error::MarshalError(format!(
            "expected element '{}'",
            NODE_ENCRYPTED_KEY
        )));
    }

    let mut encrypted_key = EncryptedKey {
        base: unmarshal_encrypted_type(doc, element)?,
        recipient: doc.prop(element, PROP_RECIPIENT).map(Into::into),
        reference_list: None,
        carried_key_name: None,
    };

    if let Some(node) = first_descendant(doc, element, NODE_REFERENCE_LIST) {
        encrypted_key.reference_list = Some(unmarshal_reference_list(doc, node)?);
    }

    if let Some(node) = first_descendant(doc, element, NODE_CARRIED_KEY_NAME) {
        encrypted_key.carried_key_name = Some(doc.content(node));
    }

    Ok(encrypted_key)
}

fn unmarshal_encrypted_type(doc: &Document, element: NodeId) -> Result<EncryptedType, Error> {
    let mut encrypted = EncryptedType::default();

    encrypted.id = doc.prop(element, PROP_ID).map(Into::into);
    encrypted.mime_type = doc.prop(element, PROP_MIME_TYPE).map(Into::into);

    // Type and Encoding are copied verbatim
    encrypted.set_type_verbatim(doc.prop(element, PROP_TYPE).map(Into::into));
    encrypted.set_encoding_verbatim(doc.prop(element, PROP_ENCODING).map(Into::into));

    if let Some(node) = first_descendant(doc, element, NODE_ENCRYPTION_METHOD) {
        encrypted.encryption_method = Some(unmarshal_encryption_method(doc, node)?);
    }

    if let Some(node) = doc.find_element(element, NODE_KEY_INFO, NS_XMLDSIG) {
        encrypted.key_info = Some(unmarshal_key_info(doc, node)?);
    }

    // the last CipherData in document order belongs to this element,
    // earlier occurrences live in nested KeyInfo/EncryptedKey structures
    let cipher_data_node = last_descendant(doc, element, NODE_CIPHER_DATA).ok_or_else(|| {
        Error::MarshalError(format!("element '{}' is missing", NODE_CIPHER_DATA))
    })?;
    encrypted.cipher_data = unmarshal_cipher_data(doc, cipher_data_node)?;

    if let Some(node) = first_descendant(doc, element, NODE_ENCRYPTION_PROPERTIES) {
        encrypted.encryption_properties = Some(unmarshal_encryption_properties(doc, node)?);
    }

    Ok(encrypted)
}

fn unmarshal_encryption_method(doc: &Document, element: NodeId) -> Result<EncryptionMethod, Error> {
    let algorithm = doc.prop(element, PROP_ALGORITHM).ok_or_else(|| {
        Error::MarshalError(format!(
            "element '{}' is missing the '{}' property",
            NODE_ENCRYPTION_METHOD, PROP_ALGORITHM
        ))
    })?;

    let mut method = EncryptionMethod::new(algorithm);

    if let Some(node) = first_descendant(doc, element, NODE_KEY_SIZE) {
        let text = doc.content(node);
        let key_size = text.trim().parse::<usize>().map_err(|_| {
            Error::MarshalError(format!("invalid '{}' value '{}'", NODE_KEY_SIZE, text))
        })?;

        method.key_size = Some(key_size);
    }

    if let Some(node) = first_descendant(doc, element, NODE_OAEP_PARAMS) {
        let text: String = doc.content(node).split_whitespace().collect();
        let params = decode(&text).map_err(|err| Error::MarshalError(err.to_string()))?;

        method.oaep_params = Some(params);
    }

    Ok(method)
}

fn unmarshal_cipher_data(doc: &Document, element: NodeId) -> Result<CipherData, Error> {
    let mut child = doc.first_child(element).and_then(|n| doc.next_element(n));

    while let Some(node) = child {
        if doc.is_element_named(node, NODE_CIPHER_VALUE, NS_XMLENC) {
            return Ok(CipherData::with_value(
                doc.content(node).split_whitespace().collect::<String>(),
            ));
        }

        if doc.is_element_named(node, NODE_CIPHER_REFERENCE, NS_XMLENC) {
            let uri = doc.prop(node, PROP_URI).ok_or_else(|| {
                Error::MarshalError(format!(
                    "element '{}' is missing the '{}' property",
                    NODE_CIPHER_REFERENCE, PROP_URI
                ))
            })?;

            let mut reference = CipherReference::new(uri);

            if let Some(transforms) = first_descendant(doc, node, NODE_TRANSFORMS) {
                reference.transforms = TransformChain::unmarshal(doc, transforms, false)?;
            }

            return Ok(CipherData::with_reference(reference));
        }

        child = doc.next_sibling(node).and_then(|n| doc.next_element(n));
    }

    Err(Error::MarshalError(format!(
        "element '{}' carries neither '{}' nor '{}'",
        NODE_CIPHER_DATA, NODE_CIPHER_VALUE, NODE_CIPHER_REFERENCE
    )))
}

fn unmarshal_encryption_properties(
    doc: &Document,
    element: NodeId,
) -> Result<EncryptionProperties, Error> {
    let mut properties = EncryptionProperties {
        id: doc.prop(element, PROP_ID).map(Into::into),
        properties: Vec::new(),
    };

    let mut child = doc.first_child(element).and_then(|n| doc.next_element(n));
    while let Some(node) = child {
        if doc.is_element_named(node, NODE_ENCRYPTION_PROPERTY, NS_XMLENC) {
            properties.properties.push(EncryptionProperty {
                id: doc.prop(node, PROP_ID).map(Into::into),
                target: doc.prop(node, PROP_TARGET).map(Into::into),
                content: doc.content(node),
            });
        }

        child = doc.next_sibling(node).and_then(|n| doc.next_element(n));
    }

    Ok(properties)
}

fn unmarshal_reference_list(doc: &Document, element: NodeId) -> Result<ReferenceList, Error> {
    let mut list = ReferenceList::new();

    let mut child = doc.first_child(element).and_then(|n| doc.next_element(n));
    while let Some(node) = child {
        let uri = doc.prop(node, PROP_URI).unwrap_or_default();

        if doc.is_element_named(node, NODE_DATA_REFERENCE, NS_XMLENC) {
            list.add_data_reference(uri)?;
        } else if doc.is_element_named(node, NODE_KEY_REFERENCE, NS_XMLENC) {
            list.add_key_reference(uri)?;
        } else {
            return Err(Error::MarshalError(format!(
                "unexpected element '{}' in '{}'",
                doc.name(node).unwrap_or("<unknown>"),
                NODE_REFERENCE_LIST
            )));
        }

        child = doc.next_sibling(node).and_then(|n| doc.next_element(n));
    }

    Ok(list)
}

/// Registers every `Id` attribute below `element` as a DOM ID.
pub fn register_ids(doc: &mut Document, element: NodeId) {
    for node in doc.descendants(element) {
        if doc.kind(node) == NodeKind::Element {
            if let Some(id) = doc.prop(node, PROP_ID) {
                let id = id.to_owned();
                doc.register_id(&id, node);
            }
        }
    }
}

fn first_descendant(doc: &Document, from: NodeId, name: &str) -> Option<NodeId> {
    doc.find_element(from, name, NS_XMLENC)
}

fn last_descendant(doc: &Document, from: NodeId, name: &str) -> Option<NodeId> {
    doc.descendants(from)
        .into_iter()
        .filter(|n| doc.is_element_named(*n, name, NS_XMLENC))
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::CIPHER_AES128;

    fn host_doc() -> Document {
        "<host/>".parse::<Document>().unwrap()
    }

    #[test]
    fn encrypted_data_round_trip() {
        let mut encrypted = EncryptedData::new(CipherData::with_value("Y2lwaGVy"));
        encrypted.base.id = Some("ed-1".into());
        encrypted
            .base
            .set_type(Some("http://www.w3.org/2001/04/xmlenc#Element"))
            .unwrap();
        encrypted.base.mime_type = Some("text/xml".into());
        encrypted.base.encryption_method = Some(EncryptionMethod::new(CIPHER_AES128));

        let mut doc = host_doc();
        let root = doc.document_element().unwrap();
        let element = marshal_encrypted_data(&mut doc, &encrypted).unwrap();
        doc.append_child(root, element).unwrap();

        let parsed = unmarshal_encrypted_data(&doc, element).unwrap();
        assert_eq!(parsed, encrypted);

        // Id attributes become DOM IDs
        assert_eq!(doc.element_by_id("ed-1"), Some(element));
    }

    #[test]
    fn encrypted_key_round_trip() {
        let mut encrypted = EncryptedKey::new(CipherData::with_value("a2V5"));
        encrypted.recipient = Some("bob".into());
        encrypted.carried_key_name = Some("session".into());
        encrypted.base.encryption_method =
            Some(EncryptionMethod::new(crate::KEYWRAP_AES192));

        let mut list = ReferenceList::new();
        list.add_data_reference("#ed-1").unwrap();
        encrypted.reference_list = Some(list);

        let mut doc = host_doc();
        let root = doc.document_element().unwrap();
        let element = marshal_encrypted_key(&mut doc, &encrypted).unwrap();
        doc.append_child(root, element).unwrap();

        let parsed = unmarshal_encrypted_key(&doc, element).unwrap();
        assert_eq!(parsed, encrypted);
    }

    #[test]
    fn schema_order_is_stable() {
        let mut encrypted = EncryptedData::new(CipherData::with_value("AA=="));
        encrypted.base.encryption_method = Some(EncryptionMethod::new(CIPHER_AES128));
        encrypted.base.encryption_properties = Some(EncryptionProperties {
            id: None,
            properties: vec![EncryptionProperty {
                id: None,
                target: None,
                content: "ts".into(),
            }],
        });

        let mut doc = host_doc();
        let root = doc.document_element().unwrap();
        let element = marshal_encrypted_data(&mut doc, &encrypted).unwrap();
        doc.append_child(root, element).unwrap();

        let names: Vec<_> = doc
            .children(element)
            .iter()
            .filter_map(|n| doc.name(*n))
            .collect();

        assert_eq!(
            names,
            vec![
                NODE_ENCRYPTION_METHOD,
                NODE_CIPHER_DATA,
                NODE_ENCRYPTION_PROPERTIES
            ]
        );
    }

    #[test]
    fn nested_encrypted_key_cipher_data_is_skipped() {
        let xml = format!(
            "<xenc:EncryptedData xmlns:xenc=\"{ns}\" xmlns:ds=\"{ds}\">\
             <ds:KeyInfo><xenc:EncryptedKey>\
             <xenc:CipherData><xenc:CipherValue>aW5uZXI=</xenc:CipherValue></xenc:CipherData>\
             </xenc:EncryptedKey></ds:KeyInfo>\
             <xenc:CipherData><xenc:CipherValue>b3V0ZXI=</xenc:CipherValue></xenc:CipherData>\
             </xenc:EncryptedData>",
            ns = NS_XMLENC,
            ds = NS_XMLDSIG
        );

        let doc = xml.parse::<Document>().unwrap();
        let element = doc.document_element().unwrap();

        let parsed = unmarshal_encrypted_data(&doc, element).unwrap();
        assert_eq!(parsed.base.cipher_data.value(), Some("b3V0ZXI="));

        // the nested key keeps its own CipherData
        let key_info = parsed.base.key_info.unwrap();
        let nested = key_info.encrypted_keys().next().unwrap();
        assert_eq!(nested.base.cipher_data.value(), Some("aW5uZXI="));
    }
}
