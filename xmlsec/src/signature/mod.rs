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

mod keys;
mod reference;

use base64::{decode, encode};
use log::warn;
use openssl::hash::MessageDigest;
use openssl::sign::{Signer, Verifier};
use xmldom::{Document, NodeId};

use crate::transform::{create_dsig_element, PROP_ALGORITHM};
use crate::{
    Canonicalizer, Context, Data, DataVisibility, Error, Key, NS_XMLDSIG, SIGNATURE_RSA_SHA1,
    SIGNATURE_RSA_SHA256,
};

pub use keys::*;
pub use reference::*;

pub const NODE_SIGNATURE: &str = "Signature";
pub const NODE_SIGNED_INFO: &str = "SignedInfo";
pub const NODE_SIGNATURE_VALUE: &str = "SignatureValue";
pub const NODE_CANONICALIZATION_METHOD: &str = "CanonicalizationMethod";
pub const NODE_SIGNATURE_METHOD: &str = "SignatureMethod";
pub const NODE_OBJECT: &str = "Object";

/// The signed aggregate: canonicalization method, signature method and
/// the ordered reference list.
pub struct SignedInfo {
    pub id: Option<String>,
    c14n_method: String,
    signature_method: String,
    references: Vec<Reference>,
    element: Option<NodeId>,
}

impl SignedInfo {
    pub fn new(c14n_method: &str, signature_method: &str) -> Self {
        Self {
            id: None,
            c14n_method: c14n_method.into(),
            signature_method: signature_method.into(),
            references: Vec::new(),
            element: None,
        }
    }

    pub fn c14n_method(&self) -> &str {
        &self.c14n_method
    }

    pub fn signature_method(&self) -> &str {
        &self.signature_method
    }

    pub fn add_reference(&mut self, reference: Reference) -> &mut Self {
        self.references.push(reference);

        self
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    pub fn references_mut(&mut self) -> &mut [Reference] {
        &mut self.references
    }
}

/// Per-reference outcome of a signature verification. The signature value
/// check and every reference are always evaluated.
#[derive(Debug)]
pub struct SignatureValidationResult {
    pub signature_valid: bool,
    pub reference_results: Vec<bool>,
}

impl SignatureValidationResult {
    pub fn is_valid(&self) -> bool {
        self.signature_valid && self.reference_results.iter().all(|r| *r)
    }
}

/// An XML signature: `SignedInfo`, the signature value and an optional
/// `KeyInfo`.
pub struct XmlSignature {
    signed_info: SignedInfo,
    key_info: Option<KeyInfo>,
    signature_value: Option<Vec<u8>>,
    element: Option<NodeId>,
    signature_value_node: Option<NodeId>,
    signed_info_octets: Option<Vec<u8>>,
}

impl XmlSignature {
    pub fn new(signed_info: SignedInfo) -> Self {
        Self {
            signed_info,
            key_info: None,
            signature_value: None,
            element: None,
            signature_value_node: None,
            signed_info_octets: None,
        }
    }

    pub fn signed_info(&self) -> &SignedInfo {
        &self.signed_info
    }

    pub fn signed_info_mut(&mut self) -> &mut SignedInfo {
        &mut self.signed_info
    }

    pub fn set_key_info(&mut self, key_info: KeyInfo) {
        self.key_info = Some(key_info);
    }

    pub fn key_info(&self) -> Option<&KeyInfo> {
        self.key_info.as_ref()
    }

    pub fn signature_value(&self) -> Option<&[u8]> {
        self.signature_value.as_deref()
    }

    /// The canonicalized `SignedInfo` octets of the last sign or verify
    /// run.
    pub fn signed_info_octets(&self) -> Option<&[u8]> {
        self.signed_info_octets.as_deref()
    }

    pub fn element(&self) -> Option<NodeId> {
        self.element
    }

    /// First `ds:Signature` element at or below `from`.
    pub fn find(doc: &Document, from: NodeId) -> Option<NodeId> {
        doc.find_element(from, NODE_SIGNATURE, NS_XMLDSIG)
    }

    /// Builds the signature tree under `parent`. References are emitted
    /// with empty digest values; [`sign`](Self::sign) fills them in.
    pub fn marshal(
        &mut self,
        doc: &mut Document,
        parent: NodeId,
        prefix: Option<&str>,
        ctx: &Context,
    ) -> Result<NodeId, Error> {
        let signature = create_dsig_element(doc, NODE_SIGNATURE, prefix);
        doc.append_child(parent, signature)?;

        if doc.resolve_prefix(parent, prefix).as_deref() != Some(NS_XMLDSIG) {
            doc.set_ns_decl(signature, prefix, NS_XMLDSIG)?;
        }

        let signed_info = create_dsig_element(doc, NODE_SIGNED_INFO, prefix);
        doc.append_child(signature, signed_info)?;

        if let Some(id) = &self.signed_info.id {
            doc.set_attr(signed_info, "Id", id)?;
            doc.register_id(id, signed_info);
        }

        let c14n_method = create_dsig_element(doc, NODE_CANONICALIZATION_METHOD, prefix);
        doc.set_attr(c14n_method, PROP_ALGORITHM, &self.signed_info.c14n_method)?;
        doc.append_child(signed_info, c14n_method)?;

        let signature_method = create_dsig_element(doc, NODE_SIGNATURE_METHOD, prefix);
        doc.set_attr(
            signature_method,
            PROP_ALGORITHM,
            &self.signed_info.signature_method,
        )?;
        doc.append_child(signed_info, signature_method)?;

        for reference in &mut self.signed_info.references {
            reference.marshal(doc, signed_info, prefix, ctx)?;
        }

        let signature_value = create_dsig_element(doc, NODE_SIGNATURE_VALUE, prefix);
        doc.append_child(signature, signature_value)?;

        if let Some(key_info) = &self.key_info {
            let element = marshal_key_info(doc, key_info, prefix)?;
            doc.append_child(signature, element)?;
        }

        self.element = Some(signature);
        self.signed_info.element = Some(signed_info);
        self.signature_value_node = Some(signature_value);

        Ok(signature)
    }

    /// Digests every reference, canonicalizes `SignedInfo` and signs the
    /// resulting octets with the private key.
    pub fn sign(&mut self, doc: &mut Document, ctx: &Context, key: &Key) -> Result<(), Error> {
        let signature = self.element.ok_or_else(|| {
            Error::InvalidState("signature is not attached to a document".into())
        })?;

        for reference in &mut self.signed_info.references {
            reference.digest(doc, ctx, Some(signature))?;
        }

        let octets = self.canonicalize_signed_info(doc)?;

        let pkey = match key {
            Key::RsaPrivate(pkey) => pkey,
            x => {
                return Err(Error::InvalidInput(format!(
                    "signing requires an RSA private key, got a {} key",
                    x.kind()
                )))
            }
        };

        let digest = signature_digest(&self.signed_info.signature_method)?;

        let mut signer =
            Signer::new(digest, pkey).map_err(|err| Error::SignatureError(err.to_string()))?;
        signer
            .update(&octets)
            .map_err(|err| Error::SignatureError(err.to_string()))?;
        let value = signer
            .sign_to_vec()
            .map_err(|err| Error::SignatureError(err.to_string()))?;

        if let Some(node) = self.signature_value_node {
            doc.remove_children(node);

            let text = doc.create_text(&encode(&value));
            doc.append_child(node, text)?;
        }

        self.signed_info_octets = Some(octets);
        self.signature_value = Some(value);

        Ok(())
    }

    /// Verifies the signature value and validates every reference. A
    /// failing reference never short-circuits the others.
    pub fn verify(
        &mut self,
        doc: &Document,
        ctx: &Context,
        key: Option<&Key>,
    ) -> Result<SignatureValidationResult, Error> {
        let signature = self.element.ok_or_else(|| {
            Error::InvalidState("signature is not attached to a document".into())
        })?;

        let value = self
            .signature_value
            .clone()
            .ok_or_else(|| Error::InvalidState("signature carries no signature value".into()))?;

        let resolved;
        let key = match key {
            Some(key) => key,
            None => {
                resolved = self.resolve_verification_key(ctx)?;

                &resolved
            }
        };

        let octets = self.canonicalize_signed_info(doc)?;

        let digest = signature_digest(&self.signed_info.signature_method)?;

        let mut verifier = match key {
            Key::RsaPublic(pkey) => Verifier::new(digest, pkey),
            Key::RsaPrivate(pkey) => Verifier::new(digest, pkey),
            x => {
                return Err(Error::InvalidInput(format!(
                    "verification requires an RSA key, got a {} key",
                    x.kind()
                )))
            }
        }
        .map_err(|err| Error::SignatureError(err.to_string()))?;
        verifier
            .update(&octets)
            .map_err(|err| Error::SignatureError(err.to_string()))?;
        let signature_valid = verifier
            .verify(&value)
            .map_err(|err| Error::SignatureError(err.to_string()))?;

        self.signed_info_octets = Some(octets);

        let mut reference_results = Vec::new();
        for reference in &mut self.signed_info.references {
            let result = match reference.validate(doc, ctx, Some(signature)) {
                Ok(result) => result,
                Err(err) => {
                    warn!(
                        "Unable to validate reference '{}': {}",
                        reference.uri().unwrap_or(""),
                        err
                    );

                    false
                }
            };

            reference_results.push(result);
        }

        Ok(SignatureValidationResult {
            signature_valid,
            reference_results,
        })
    }

    fn resolve_verification_key(&self, ctx: &Context) -> Result<Key, Error> {
        if let Some(selector) = &ctx.key_selector {
            if let Some(key) = selector.select(
                self.key_info.as_ref(),
                KeyPurpose::Verify,
                &self.signed_info.signature_method,
                ctx,
            )? {
                return Ok(key);
            }
        }

        if let Some(key_info) = &self.key_info {
            if let Some(key) = resolve_verification_key(key_info) {
                return Ok(key);
            }
        }

        Err(Error::KeyResolutionError(
            "unable to find a verification key".into(),
        ))
    }

    fn canonicalize_signed_info(&self, doc: &Document) -> Result<Vec<u8>, Error> {
        let signed_info = self.signed_info.element.ok_or_else(|| {
            Error::InvalidState("SignedInfo is not attached to a document".into())
        })?;

        let canonicalizer = Canonicalizer::new(&self.signed_info.c14n_method)?;
        let data = Data::sub_tree(signed_info, false);
        let visibility = DataVisibility::new(&data)?;

        let mut octets = Vec::new();
        canonicalizer.canonicalize_reset(doc, &visibility, None, &mut octets)?;

        Ok(octets)
    }

    /// Reads a `ds:Signature` element.
    pub fn from_element(doc: &Document, element: NodeId, ctx: &Context) -> Result<Self, Error> {
        if !doc.is_element_named(element, NODE_SIGNATURE, NS_XMLDSIG) {
            return Err(Error::MarshalError(format!(
                "expected element '{}'",
                NODE_SIGNATURE
            )));
        }

        let mut child = doc.first_child(element).and_then(|n| doc.next_element(n));

        let signed_info_node = expect_element(doc, &mut child, NODE_SIGNED_INFO)?;
        let signature_value_node = expect_element(doc, &mut child, NODE_SIGNATURE_VALUE)?;

        let key_info = match child {
            Some(node) if doc.is_element_named(node, NODE_KEY_INFO, NS_XMLDSIG) => {
                child = doc.next_sibling(node).and_then(|n| doc.next_element(n));

                Some(unmarshal_key_info(doc, node)?)
            }
            _ => None,
        };

        // trailing Object elements carry application payloads
        while let Some(node) = child {
            if !doc.is_element_named(node, NODE_OBJECT, NS_XMLDSIG) {
                return Err(Error::MarshalError(format!(
                    "unexpected element '{}' in '{}'",
                    doc.name(node).unwrap_or("<unknown>"),
                    NODE_SIGNATURE
                )));
            }

            child = doc.next_sibling(node).and_then(|n| doc.next_element(n));
        }

        let mut signed_info = Self::unmarshal_signed_info(doc, signed_info_node, ctx)?;
        signed_info.element = Some(signed_info_node);

        let signature_value: String = doc
            .content(signature_value_node)
            .split_whitespace()
            .collect();
        let signature_value =
            decode(&signature_value).map_err(|err| Error::MarshalError(err.to_string()))?;

        Ok(Self {
            signed_info,
            key_info,
            signature_value: Some(signature_value),
            element: Some(element),
            signature_value_node: Some(signature_value_node),
            signed_info_octets: None,
        })
    }

    fn unmarshal_signed_info(
        doc: &Document,
        element: NodeId,
        ctx: &Context,
    ) -> Result<SignedInfo, Error> {
        let mut child = doc.first_child(element).and_then(|n| doc.next_element(n));

        let c14n_node = expect_element(doc, &mut child, NODE_CANONICALIZATION_METHOD)?;
        let method_node = expect_element(doc, &mut child, NODE_SIGNATURE_METHOD)?;

        let c14n_method = require_algorithm(doc, c14n_node, NODE_CANONICALIZATION_METHOD)?;
        let signature_method = require_algorithm(doc, method_node, NODE_SIGNATURE_METHOD)?;

        let mut references = Vec::new();
        while let Some(node) = child {
            if !doc.is_element_named(node, NODE_REFERENCE, NS_XMLDSIG) {
                return Err(Error::MarshalError(format!(
                    "unexpected element '{}' in '{}'",
                    doc.name(node).unwrap_or("<unknown>"),
                    NODE_SIGNED_INFO
                )));
            }

            references.push(Reference::from_element(doc, node, ctx)?);

            child = doc.next_sibling(node).and_then(|n| doc.next_element(n));
        }

        if references.is_empty() {
            return Err(Error::MarshalError(format!(
                "element '{}' contains no references",
                NODE_SIGNED_INFO
            )));
        }

        Ok(SignedInfo {
            id: doc.prop(element, "Id").map(Into::into),
            c14n_method,
            signature_method,
            references,
            element: None,
        })
    }
}

fn expect_element(
    doc: &Document,
    child: &mut Option<NodeId>,
    name: &str,
) -> Result<NodeId, Error> {
    let node = child.ok_or_else(|| {
        Error::MarshalError(format!("expected element '{}' but found end", name))
    })?;

    if !doc.is_element_named(node, name, NS_XMLDSIG) {
        return Err(Error::MarshalError(format!(
            "expected element '{}' but found '{}'",
            name,
            doc.name(node).unwrap_or("<unknown>")
        )));
    }

    *child = doc.next_sibling(node).and_then(|n| doc.next_element(n));

    Ok(node)
}

fn require_algorithm(doc: &Document, node: NodeId, name: &str) -> Result<String, Error> {
    doc.prop(node, PROP_ALGORITHM)
        .map(Into::into)
        .ok_or_else(|| {
            Error::MarshalError(format!(
                "element '{}' is missing the '{}' property",
                name, PROP_ALGORITHM
            ))
        })
}

fn signature_digest(uri: &str) -> Result<MessageDigest, Error> {
    match uri {
        SIGNATURE_RSA_SHA1 => Ok(MessageDigest::sha1()),
        SIGNATURE_RSA_SHA256 => Ok(MessageDigest::sha256()),
        x => Err(Error::AlgorithmUnsupported(x.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;

    use crate::transform::EnvelopedTransform;
    use crate::{DIGEST_SHA256, TRANSFORM_C14N_1_0};

    fn key_pair() -> Key {
        let rsa = Rsa::generate(2048).unwrap();

        Key::RsaPrivate(PKey::from_rsa(rsa).unwrap())
    }

    fn enveloped_signature(doc: &mut Document, key: &Key) -> XmlSignature {
        let root = doc.document_element().unwrap();
        let ctx = Context::new();

        let mut signed_info = SignedInfo::new(TRANSFORM_C14N_1_0, SIGNATURE_RSA_SHA256);
        let mut reference = Reference::new(Some(""), DIGEST_SHA256).unwrap();
        reference.add_transform(Box::new(EnvelopedTransform));
        signed_info.add_reference(reference);

        let mut signature = XmlSignature::new(signed_info);
        signature.marshal(doc, root, Some("ds"), &ctx).unwrap();
        signature.sign(doc, &ctx, key).unwrap();

        signature
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let mut doc = "<order><item>book</item></order>".parse::<Document>().unwrap();
        let key = key_pair();

        enveloped_signature(&mut doc, &key);

        let ctx = Context::new();
        let element = XmlSignature::find(&doc, doc.root()).unwrap();
        let mut parsed = XmlSignature::from_element(&doc, element, &ctx).unwrap();

        let result = parsed.verify(&doc, &ctx, Some(&key)).unwrap();
        assert!(result.signature_valid);
        assert_eq!(result.reference_results, vec![true]);
        assert!(result.is_valid());
    }

    #[test]
    fn tampering_fails_reference_but_not_others() {
        let mut doc = "<order><item Id=\"a\">book</item><item Id=\"b\">pen</item></order>"
            .parse::<Document>()
            .unwrap();
        let key = key_pair();
        let root = doc.document_element().unwrap();
        let ctx = Context::new();

        let mut signed_info = SignedInfo::new(TRANSFORM_C14N_1_0, SIGNATURE_RSA_SHA256);
        signed_info.add_reference(Reference::new(Some("#a"), DIGEST_SHA256).unwrap());
        signed_info.add_reference(Reference::new(Some("#b"), DIGEST_SHA256).unwrap());

        let mut signature = XmlSignature::new(signed_info);
        signature.marshal(&mut doc, root, Some("ds"), &ctx).unwrap();
        signature.sign(&mut doc, &ctx, &key).unwrap();

        // tamper with the first item only
        let a = doc.find_by_id_attr("a").unwrap();
        doc.remove_children(a);
        let text = doc.create_text("magazine");
        doc.append_child(a, text).unwrap();

        let element = XmlSignature::find(&doc, doc.root()).unwrap();
        let mut parsed = XmlSignature::from_element(&doc, element, &ctx).unwrap();

        let result = parsed.verify(&doc, &ctx, Some(&key)).unwrap();
        assert_eq!(result.reference_results, vec![false, true]);
        assert!(!result.is_valid());
    }

    #[test]
    fn verify_survives_reserialization() {
        let mut doc = "<order><item>book</item></order>".parse::<Document>().unwrap();
        let key = key_pair();

        enveloped_signature(&mut doc, &key);

        // ship the signed document as text and verify the reparsed form
        let wire = doc.to_xml();
        let doc = wire.parse::<Document>().unwrap();

        let ctx = Context::new();
        let element = XmlSignature::find(&doc, doc.root()).unwrap();
        let mut parsed = XmlSignature::from_element(&doc, element, &ctx).unwrap();

        let result = parsed.verify(&doc, &ctx, Some(&key)).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn wrong_key_fails_signature_value() {
        let mut doc = "<order><item>book</item></order>".parse::<Document>().unwrap();
        let key = key_pair();

        enveloped_signature(&mut doc, &key);

        let ctx = Context::new();
        let element = XmlSignature::find(&doc, doc.root()).unwrap();
        let mut parsed = XmlSignature::from_element(&doc, element, &ctx).unwrap();

        let other = key_pair();
        let result = parsed.verify(&doc, &ctx, Some(&other)).unwrap();
        assert!(!result.signature_valid);
        // the references themselves still digest correctly
        assert_eq!(result.reference_results, vec![true]);
    }

    #[test]
    fn verification_key_from_key_value() {
        let mut doc = "<order><item>book</item></order>".parse::<Document>().unwrap();

        let rsa = Rsa::generate(2048).unwrap();
        let modulus = encode(rsa.n().to_vec());
        let exponent = encode(rsa.e().to_vec());
        let key = Key::RsaPrivate(PKey::from_rsa(rsa).unwrap());

        let root = doc.document_element().unwrap();
        let ctx = Context::new();

        let mut signed_info = SignedInfo::new(TRANSFORM_C14N_1_0, SIGNATURE_RSA_SHA256);
        let mut reference = Reference::new(Some(""), DIGEST_SHA256).unwrap();
        reference.add_transform(Box::new(EnvelopedTransform));
        signed_info.add_reference(reference);

        let mut signature = XmlSignature::new(signed_info);

        let mut key_info = KeyInfo::new();
        key_info.entries.push(KeyInfoEntry::KeyValue(RsaKeyValue {
            modulus,
            exponent,
        }));
        signature.set_key_info(key_info);

        signature.marshal(&mut doc, root, Some("ds"), &ctx).unwrap();
        signature.sign(&mut doc, &ctx, &key).unwrap();

        let element = XmlSignature::find(&doc, doc.root()).unwrap();
        let mut parsed = XmlSignature::from_element(&doc, element, &ctx).unwrap();

        // no explicit key: resolved from KeyInfo
        let result = parsed.verify(&doc, &ctx, None).unwrap();
        assert!(result.is_valid());
    }
}
