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

use std::io::Cursor;

use base64::{decode, encode};
use bytes::Bytes;
use openssl::memcmp;
use xmldom::{Document, Here, NodeId};

use crate::dereference::{dereference, validate_uri_reference, DereferenceRequest};
use crate::transform::{
    create_dsig_element, TransformChain, TransformContext, NODE_TRANSFORM, NODE_TRANSFORMS,
    PROP_ALGORITHM,
};
use crate::{
    Context, Data, DigestSink, Error, OctetSink, Registry, TeeSink, NS_XMLDSIG,
    TRANSFORM_C14N_1_1,
};

pub const NODE_REFERENCE: &str = "Reference";
pub const NODE_DIGEST_METHOD: &str = "DigestMethod";
pub const NODE_DIGEST_VALUE: &str = "DigestValue";

pub const PROP_URI: &str = "URI";
pub const PROP_TYPE: &str = "Type";
pub const PROP_ID: &str = "Id";

/// One signed item: URI, transform chain, digest method and digest value.
///
/// A reference is constructed from the API or read from an element, then
/// either digested (sign path) or validated (verify path). `digest_value`
/// is present exactly when the reference has been digested.
pub struct Reference {
    uri: Option<String>,
    type_: Option<String>,
    id: Option<String>,
    digest_method: String,
    transforms: TransformChain,
    digest_value: Option<Vec<u8>>,
    calculated_digest_value: Option<Vec<u8>>,
    validation_status: Option<bool>,
    applied_transform_data: Option<Bytes>,
    cached_data: Option<Data>,
    digest_input: Option<Vec<u8>>,
    digest_value_node: Option<NodeId>,
    here: Option<Here>,
}

impl Reference {
    pub fn new(uri: Option<&str>, digest_method: &str) -> Result<Self, Error> {
        if let Some(uri) = uri {
            validate_uri_reference(uri)?;
        }

        Ok(Self {
            uri: uri.map(Into::into),
            type_: None,
            id: None,
            digest_method: digest_method.into(),
            transforms: TransformChain::new(),
            digest_value: None,
            calculated_digest_value: None,
            validation_status: None,
            applied_transform_data: None,
            cached_data: None,
            digest_input: None,
            digest_value_node: None,
            here: None,
        })
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.into());

        self
    }

    pub fn with_type(mut self, type_: &str) -> Result<Self, Error> {
        validate_uri_reference(type_)?;
        self.type_ = Some(type_.into());

        Ok(self)
    }

    /// Bypasses dereferencing and transformation: the given octets are
    /// digested directly.
    pub fn with_applied_transform_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.applied_transform_data = Some(data.into());

        self
    }

    pub fn add_transform(&mut self, transform: Box<dyn crate::transform::Transform>) -> &mut Self {
        self.transforms.push(transform);

        self
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn type_(&self) -> Option<&str> {
        self.type_.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn digest_method(&self) -> &str {
        &self.digest_method
    }

    pub fn transforms(&self) -> &TransformChain {
        &self.transforms
    }

    pub fn digest_value(&self) -> Option<&[u8]> {
        self.digest_value.as_deref()
    }

    pub fn calculated_digest_value(&self) -> Option<&[u8]> {
        self.calculated_digest_value.as_deref()
    }

    pub fn is_digested(&self) -> bool {
        self.digest_value.is_some()
    }

    /// Dereferenced data, retained when `cache_reference` is enabled.
    pub fn dereferenced_data(&self) -> Option<&Data> {
        self.cached_data.as_ref()
    }

    /// Replays the exact octets fed to the digest, retained when
    /// `cache_reference` is enabled.
    pub fn digest_input_stream(&self) -> Option<Cursor<Vec<u8>>> {
        self.digest_input.clone().map(Cursor::new)
    }

    fn check_digest_algorithm(&self, ctx: &Context) -> Result<(), Error> {
        if ctx.secure_validation && Registry::global().is_denied(&self.digest_method) {
            return Err(Error::MarshalError(format!(
                "digest algorithm '{}' is forbidden under secure validation",
                self.digest_method
            )));
        }

        Ok(())
    }

    /// Runs dereferencing and the transform chain, feeding `sink` with
    /// the digest input octets.
    fn transform_into(
        &mut self,
        doc: &Document,
        ctx: &Context,
        signature_node: Option<NodeId>,
        sink: &mut dyn OctetSink,
    ) -> Result<(), Error> {
        if let Some(pre) = self.applied_transform_data.clone() {
            if ctx.cache_reference {
                self.digest_input = Some(pre.to_vec());
            }

            return sink.write_octets(&pre);
        }

        let request = DereferenceRequest {
            uri: self.uri.as_deref(),
            base_uri: ctx.base_uri.as_deref(),
            here: self.here.clone(),
        };

        let data = dereference(doc, &request, ctx)?;

        let transform_ctx = TransformContext {
            signature_node,
            here: self.here.clone(),
            use_c14n11: ctx.use_c14n11,
        };

        if ctx.cache_reference {
            self.cached_data = Some(data.clone());

            let mut tee = TeeSink::new(sink);
            self.transforms.execute(doc, data, &transform_ctx, &mut tee)?;
            self.digest_input = Some(tee.into_copy());

            Ok(())
        } else {
            self.transforms.execute(doc, data, &transform_ctx, sink)
        }
    }

    /// Sign path: computes and stores the digest value, writing its
    /// Base64 form into the bound `DigestValue` element.
    pub fn digest(
        &mut self,
        doc: &mut Document,
        ctx: &Context,
        signature_node: Option<NodeId>,
    ) -> Result<(), Error> {
        if self.is_digested() {
            return Err(Error::InvalidState("reference is already digested".into()));
        }

        self.check_digest_algorithm(ctx)?;

        let digest = Registry::global().lookup_digest(&self.digest_method)?;
        let mut sink = DigestSink::new(digest)?;

        self.transform_into(doc, ctx, signature_node, &mut sink)
            .map_err(Error::into_signature)?;

        let value = sink.finish()?;

        if let Some(node) = self.digest_value_node {
            doc.remove_children(node);

            let text = doc.create_text(&encode(&value));
            doc.append_child(node, text)?;
        }

        self.digest_value = Some(value);

        Ok(())
    }

    /// Verify path: recomputes the digest and compares it to the stored
    /// value. Idempotent, the result of the first run is cached; a
    /// mismatch is a `false` return, not an error.
    pub fn validate(
        &mut self,
        doc: &Document,
        ctx: &Context,
        signature_node: Option<NodeId>,
    ) -> Result<bool, Error> {
        if let Some(status) = self.validation_status {
            return Ok(status);
        }

        let expected = self
            .digest_value
            .clone()
            .ok_or_else(|| Error::InvalidState("reference carries no digest value".into()))?;

        self.check_digest_algorithm(ctx)?;

        let digest = Registry::global().lookup_digest(&self.digest_method)?;
        let mut sink = DigestSink::new(digest)?;

        self.transform_into(doc, ctx, signature_node, &mut sink)
            .map_err(Error::into_signature)?;

        let calculated = sink.finish()?;

        let status = calculated.len() == expected.len() && memcmp::eq(&calculated, &expected);

        self.calculated_digest_value = Some(calculated);
        self.validation_status = Some(status);

        Ok(status)
    }

    /// Emits `<Reference Id? URI? Type?><Transforms>?<DigestMethod/>
    /// <DigestValue/></Reference>` and binds the `DigestValue` element.
    pub fn marshal(
        &mut self,
        doc: &mut Document,
        parent: NodeId,
        prefix: Option<&str>,
        ctx: &Context,
    ) -> Result<NodeId, Error> {
        let element = create_dsig_element(doc, NODE_REFERENCE, prefix);
        doc.append_child(parent, element)?;

        if doc.resolve_prefix(parent, prefix).as_deref() != Some(NS_XMLDSIG) {
            doc.set_ns_decl(element, prefix, NS_XMLDSIG)?;
        }

        if let Some(id) = &self.id {
            doc.set_attr(element, PROP_ID, id)?;
            doc.register_id(id, element);
        }

        if let Some(uri) = &self.uri {
            doc.set_attr(element, PROP_URI, uri)?;
            self.here = Some(Here {
                element,
                attr: PROP_URI.into(),
            });
        }

        if let Some(type_) = &self.type_ {
            doc.set_attr(element, PROP_TYPE, type_)?;
        }

        let materialize_c14n11 = ctx.use_c14n11 && !self.transforms.has_c14n();

        if !self.transforms.is_empty() || materialize_c14n11 {
            let transforms = create_dsig_element(doc, NODE_TRANSFORMS, prefix);
            doc.append_child(element, transforms)?;

            self.transforms.marshal_into(doc, transforms, prefix)?;

            if materialize_c14n11 {
                let transform = create_dsig_element(doc, NODE_TRANSFORM, prefix);
                doc.set_attr(transform, PROP_ALGORITHM, TRANSFORM_C14N_1_1)?;
                doc.append_child(transforms, transform)?;
            }
        }

        let digest_method = create_dsig_element(doc, NODE_DIGEST_METHOD, prefix);
        doc.set_attr(digest_method, PROP_ALGORITHM, &self.digest_method)?;
        doc.append_child(element, digest_method)?;

        let digest_value = create_dsig_element(doc, NODE_DIGEST_VALUE, prefix);
        doc.append_child(element, digest_value)?;

        if let Some(value) = &self.digest_value {
            let text = doc.create_text(&encode(value));
            doc.append_child(digest_value, text)?;
        }

        self.digest_value_node = Some(digest_value);

        Ok(element)
    }

    /// Reads a `Reference` element. Under secure validation the transform
    /// cap and the digest deny list are enforced here.
    pub fn from_element(doc: &Document, element: NodeId, ctx: &Context) -> Result<Self, Error> {
        let uri = doc.prop(element, PROP_URI).map(ToOwned::to_owned);
        if let Some(uri) = &uri {
            validate_uri_reference(uri).map_err(|err| Error::MarshalError(err.to_string()))?;
        }

        let type_ = doc.prop(element, PROP_TYPE).map(ToOwned::to_owned);
        let id = doc.prop(element, PROP_ID).map(ToOwned::to_owned);

        let mut child = doc.first_child(element).and_then(|n| doc.next_element(n));

        let transforms = match child {
            Some(node) if doc.is_element_named(node, NODE_TRANSFORMS, NS_XMLDSIG) => {
                child = doc.next_sibling(node).and_then(|n| doc.next_element(n));

                TransformChain::unmarshal(doc, node, ctx.secure_validation)?
            }
            _ => TransformChain::new(),
        };

        let digest_method_node = child.ok_or_else(|| {
            Error::MarshalError(format!("element '{}' is missing", NODE_DIGEST_METHOD))
        })?;
        if !doc.is_element_named(digest_method_node, NODE_DIGEST_METHOD, NS_XMLDSIG) {
            return Err(Error::MarshalError(format!(
                "expected element '{}' but found '{}'",
                NODE_DIGEST_METHOD,
                doc.name(digest_method_node).unwrap_or("<unknown>")
            )));
        }

        let digest_method = doc
            .prop(digest_method_node, PROP_ALGORITHM)
            .ok_or_else(|| {
                Error::MarshalError(format!(
                    "element '{}' is missing the '{}' property",
                    NODE_DIGEST_METHOD, PROP_ALGORITHM
                ))
            })?
            .to_owned();

        if ctx.secure_validation && Registry::global().is_denied(&digest_method) {
            return Err(Error::MarshalError(format!(
                "digest algorithm '{}' is forbidden under secure validation",
                digest_method
            )));
        }

        child = doc
            .next_sibling(digest_method_node)
            .and_then(|n| doc.next_element(n));

        let digest_value_node = child.ok_or_else(|| {
            Error::MarshalError(format!("element '{}' is missing", NODE_DIGEST_VALUE))
        })?;
        if !doc.is_element_named(digest_value_node, NODE_DIGEST_VALUE, NS_XMLDSIG) {
            return Err(Error::MarshalError(format!(
                "expected element '{}' but found '{}'",
                NODE_DIGEST_VALUE,
                doc.name(digest_value_node).unwrap_or("<unknown>")
            )));
        }

        let digest_value: String = doc
            .content(digest_value_node)
            .split_whitespace()
            .collect();
        let digest_value =
            decode(&digest_value).map_err(|err| Error::MarshalError(err.to_string()))?;

        let here = uri.as_ref().map(|_| Here {
            element,
            attr: PROP_URI.into(),
        });

        Ok(Self {
            uri,
            type_,
            id,
            digest_method,
            transforms,
            digest_value: Some(digest_value),
            calculated_digest_value: None,
            validation_status: None,
            applied_transform_data: None,
            cached_data: None,
            digest_input: None,
            digest_value_node: Some(digest_value_node),
            here,
        })
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.digest_method == other.digest_method
            && self.id == other.id
            && self.uri == other.uri
            && self.type_ == other.type_
            && self.transforms == other.transforms
            && self.digest_value == other.digest_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{DIGEST_SHA256, NS_XMLDSIG};

    fn signed_doc() -> (Document, Reference) {
        let mut doc = "<root><data Id=\"payload\">content</data><holder/></root>"
            .parse::<Document>()
            .unwrap();
        let holder = doc
            .search(doc.root(), &mut |d, n| d.name(n) == Some("holder"))
            .unwrap();

        let mut reference = Reference::new(Some("#payload"), DIGEST_SHA256).unwrap();
        let ctx = Context::new();
        reference.marshal(&mut doc, holder, Some("ds"), &ctx).unwrap();
        reference.digest(&mut doc, &ctx, None).unwrap();

        (doc, reference)
    }

    #[test]
    fn digest_writes_value_into_bound_element() {
        let (doc, reference) = signed_doc();

        assert!(reference.is_digested());

        let node = doc
            .search(doc.root(), &mut |d, n| {
                d.name(n) == Some(NODE_DIGEST_VALUE)
            })
            .unwrap();

        let text: String = doc.content(node);
        assert_eq!(
            decode(&text).unwrap().as_slice(),
            reference.digest_value().unwrap()
        );
    }

    #[test]
    fn round_trip_validates() {
        let (doc, _) = signed_doc();
        let ctx = Context::new();

        let element = doc
            .search(doc.root(), &mut |d, n| {
                d.is_element_named(n, NODE_REFERENCE, NS_XMLDSIG)
            })
            .unwrap();

        let mut parsed = Reference::from_element(&doc, element, &ctx).unwrap();
        assert!(parsed.validate(&doc, &ctx, None).unwrap());
    }

    #[test]
    fn validate_is_idempotent() {
        let (mut doc, _) = signed_doc();
        let ctx = Context::new();

        let element = doc
            .search(doc.root(), &mut |d, n| {
                d.is_element_named(n, NODE_REFERENCE, NS_XMLDSIG)
            })
            .unwrap();

        let mut parsed = Reference::from_element(&doc, element, &ctx).unwrap();
        assert!(parsed.validate(&doc, &ctx, None).unwrap());

        // mutate the source, the cached status must not change
        let data = doc.find_by_id_attr("payload").unwrap();
        let text = doc.create_text("tampered");
        doc.remove_children(data);
        doc.append_child(data, text).unwrap();

        assert!(parsed.validate(&doc, &ctx, None).unwrap());
    }

    #[test]
    fn tampering_flips_validation() {
        let (mut doc, _) = signed_doc();
        let ctx = Context::new();

        let data = doc.find_by_id_attr("payload").unwrap();
        let text = doc.create_text("tampered");
        doc.remove_children(data);
        doc.append_child(data, text).unwrap();

        let element = doc
            .search(doc.root(), &mut |d, n| {
                d.is_element_named(n, NODE_REFERENCE, NS_XMLDSIG)
            })
            .unwrap();

        let mut parsed = Reference::from_element(&doc, element, &ctx).unwrap();
        assert!(!parsed.validate(&doc, &ctx, None).unwrap());
    }

    #[test]
    fn cache_reference_retains_digest_input() {
        let mut doc = "<root><data Id=\"payload\">content</data><holder/></root>"
            .parse::<Document>()
            .unwrap();
        let holder = doc
            .search(doc.root(), &mut |d, n| d.name(n) == Some("holder"))
            .unwrap();

        let ctx = Context {
            cache_reference: true,
            ..Context::new()
        };

        let mut reference = Reference::new(Some("#payload"), DIGEST_SHA256).unwrap();
        reference.marshal(&mut doc, holder, Some("ds"), &ctx).unwrap();
        reference.digest(&mut doc, &ctx, None).unwrap();

        assert!(reference.dereferenced_data().is_some());

        let stream = reference.digest_input_stream().unwrap();
        let replayed = stream.into_inner();

        let digest = Registry::global().lookup_digest(DIGEST_SHA256).unwrap();
        let mut sink = DigestSink::new(digest).unwrap();
        sink.write_octets(&replayed).unwrap();

        assert_eq!(
            sink.finish().unwrap().as_slice(),
            reference.digest_value().unwrap()
        );
    }

    #[test]
    fn double_digest_is_rejected() {
        let (mut doc, mut reference) = signed_doc();
        let ctx = Context::new();

        match reference.digest(&mut doc, &ctx, None) {
            Err(Error::InvalidState(_)) => (),
            x => panic!("unexpected result: {:?}", x),
        }
    }

    #[test]
    fn transform_cap_under_secure_validation() {
        let transforms: String = (0..6)
            .map(|_| {
                format!(
                    "<Transform Algorithm=\"{}\" xmlns=\"{}\"/>",
                    crate::TRANSFORM_C14N_1_0,
                    NS_XMLDSIG
                )
            })
            .collect();
        let xml = format!(
            "<Signature xmlns=\"{ns}\"><Reference URI=\"\"><Transforms>{t}</Transforms>\
             <DigestMethod Algorithm=\"{dm}\"/><DigestValue>AA==</DigestValue></Reference></Signature>",
            ns = NS_XMLDSIG,
            t = transforms,
            dm = DIGEST_SHA256
        );
        let doc = xml.parse::<Document>().unwrap();
        let element = doc
            .search(doc.root(), &mut |d, n| {
                d.is_element_named(n, NODE_REFERENCE, NS_XMLDSIG)
            })
            .unwrap();

        let relaxed = Context::new();
        assert!(Reference::from_element(&doc, element, &relaxed).is_ok());

        let secure = Context {
            secure_validation: true,
            ..Context::new()
        };
        match Reference::from_element(&doc, element, &secure) {
            Err(Error::MarshalError(msg)) => assert!(msg.contains('5')),
            _ => panic!("unexpected result"),
        }
    }

    #[test]
    fn md5_digest_rejected_under_secure_validation() {
        let xml = format!(
            "<Signature xmlns=\"{ns}\"><Reference URI=\"\">\
             <DigestMethod Algorithm=\"{dm}\"/><DigestValue>AA==</DigestValue></Reference></Signature>",
            ns = NS_XMLDSIG,
            dm = crate::DIGEST_MD5
        );
        let doc = xml.parse::<Document>().unwrap();
        let element = doc
            .search(doc.root(), &mut |d, n| {
                d.is_element_named(n, NODE_REFERENCE, NS_XMLDSIG)
            })
            .unwrap();

        let secure = Context {
            secure_validation: true,
            ..Context::new()
        };
        match Reference::from_element(&doc, element, &secure) {
            Err(Error::MarshalError(_)) => (),
            _ => panic!("unexpected result"),
        }
    }

    #[test]
    fn structural_equality() {
        let a = Reference::new(Some("#x"), DIGEST_SHA256).unwrap();
        let b = Reference::new(Some("#x"), DIGEST_SHA256).unwrap();
        let c = Reference::new(Some("#y"), DIGEST_SHA256).unwrap();

        assert!(a == b);
        assert!(a != c);
    }
}
