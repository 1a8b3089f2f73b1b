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

use std::cell::Cell;
use std::io::{Error as IoError, ErrorKind, Write};

use xmldom::{C14nMode, Document, NodeId, NodeVisibility};

use crate::{
    C14nAlgorithm, Data, DataTypes, DataVisibility, Error, OctetSink, Registry, VecSink,
    TRANSFORM_C14N_EXCLUSIVE, TRANSFORM_C14N_EXCLUSIVE_WITH_COMMENTS,
};

use super::{Transform, TransformContext, PROP_ALGORITHM};

pub const NODE_INCLUSIVE_NAMESPACES: &str = "InclusiveNamespaces";
pub const PROP_PREFIX_LIST: &str = "PrefixList";

/* Canonicalizer */

/// Serializes a document subset to stable octets.
///
/// An instance is re-entrant only after [`reset`](Self::reset): starting a
/// second canonicalization while one is marked in use fails.
pub struct Canonicalizer {
    uri: String,
    algorithm: C14nAlgorithm,
    busy: Cell<bool>,
}

impl Canonicalizer {
    pub fn new(uri: &str) -> Result<Self, Error> {
        let algorithm = Registry::global().lookup_canonicalizer(uri)?;

        Ok(Self {
            uri: uri.into(),
            algorithm,
            busy: Cell::new(false),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn algorithm(&self) -> C14nAlgorithm {
        self.algorithm
    }

    fn not_reset(&self) -> Result<(), Error> {
        if self.busy.get() {
            Err(Error::CanonicalizationError(
                "canonicalizer is in use and has not been reset".into(),
            ))
        } else {
            Ok(())
        }
    }

    pub fn reset(&self) {
        self.busy.set(false);
    }

    pub fn canonicalize(
        &self,
        doc: &Document,
        visibility: &dyn NodeVisibility,
        inclusive_ns_prefixes: Option<&[String]>,
        out: &mut dyn Write,
    ) -> Result<(), Error> {
        self.not_reset()?;
        self.busy.set(true);

        doc.c14n(
            visibility,
            self.algorithm.mode,
            self.algorithm.with_comments,
            inclusive_ns_prefixes,
            out,
        )
        .map_err(|err| Error::CanonicalizationError(err.to_string()))
    }

    /// Canonicalizes and immediately releases the instance again.
    pub fn canonicalize_reset(
        &self,
        doc: &Document,
        visibility: &dyn NodeVisibility,
        inclusive_ns_prefixes: Option<&[String]>,
        out: &mut dyn Write,
    ) -> Result<(), Error> {
        let ret = self.canonicalize(doc, visibility, inclusive_ns_prefixes, out);
        self.reset();

        ret
    }
}

/* C14nTransform */

pub struct C14nTransform {
    canonicalizer: Canonicalizer,
    inclusive_prefixes: Vec<String>,
}

impl C14nTransform {
    pub fn new(uri: &str) -> Result<Self, Error> {
        Ok(Self {
            canonicalizer: Canonicalizer::new(uri)?,
            inclusive_prefixes: Vec::new(),
        })
    }

    pub fn with_inclusive_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.inclusive_prefixes = prefixes;

        self
    }

    fn is_exclusive(&self) -> bool {
        matches!(
            self.canonicalizer.uri(),
            TRANSFORM_C14N_EXCLUSIVE | TRANSFORM_C14N_EXCLUSIVE_WITH_COMMENTS
        )
    }
}

impl Transform for C14nTransform {
    fn algorithm(&self) -> &str {
        self.canonicalizer.uri()
    }

    fn input_types(&self) -> DataTypes {
        DataTypes::Nodes
    }

    fn terminal_capable(&self) -> bool {
        true
    }

    fn apply(&self, doc: &Document, data: Data, ctx: &TransformContext) -> Result<Data, Error> {
        let mut sink = VecSink::new();
        self.apply_terminal(doc, data, ctx, &mut sink)?;

        Ok(Data::octets(sink.into_bytes()))
    }

    fn apply_terminal(
        &self,
        doc: &Document,
        data: Data,
        _ctx: &TransformContext,
        sink: &mut dyn OctetSink,
    ) -> Result<(), Error> {
        let visibility = DataVisibility::new(&data)?;
        let prefixes = if self.inclusive_prefixes.is_empty() {
            None
        } else {
            Some(self.inclusive_prefixes.as_slice())
        };

        let mut writer = SinkWriter(sink);

        self.canonicalizer
            .canonicalize_reset(doc, &visibility, prefixes, &mut writer)
    }

    fn write_params(&self, doc: &mut Document, element: NodeId) -> Result<(), Error> {
        if self.is_exclusive() && !self.inclusive_prefixes.is_empty() {
            let child = doc.create_element(NODE_INCLUSIVE_NAMESPACES);
            doc.set_ns_decl(child, None, TRANSFORM_C14N_EXCLUSIVE)?;
            doc.set_attr(child, PROP_PREFIX_LIST, &self.inclusive_prefixes.join(" "))?;
            doc.append_child(element, child)?;
        }

        Ok(())
    }

    fn params_key(&self) -> String {
        self.inclusive_prefixes.join(" ")
    }
}

pub(crate) fn factory(doc: &Document, element: NodeId) -> Result<Box<dyn Transform>, Error> {
    let algorithm = doc
        .prop(element, PROP_ALGORITHM)
        .ok_or_else(|| Error::MarshalError(format!("missing '{}' property", PROP_ALGORITHM)))?;

    let mut transform = C14nTransform::new(algorithm)?;

    let mut child = doc.first_child(element).and_then(|n| doc.next_element(n));
    while let Some(element) = child {
        if doc.name(element) == Some(NODE_INCLUSIVE_NAMESPACES) {
            if let Some(list) = doc.prop(element, PROP_PREFIX_LIST) {
                transform.inclusive_prefixes =
                    list.split_whitespace().map(Into::into).collect();
            }
        }

        child = doc.next_sibling(element).and_then(|n| doc.next_element(n));
    }

    Ok(Box::new(transform))
}

/// Adapts an [`OctetSink`] to `std::io::Write` for the canonicalizer.
pub(crate) struct SinkWriter<'a>(pub &'a mut dyn OctetSink);

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        match self.0.write_octets(buf) {
            Ok(()) => Ok(buf.len()),
            Err(err) => Err(IoError::new(ErrorKind::Other, err)),
        }
    }

    fn flush(&mut self) -> Result<(), IoError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use xmldom::AllVisible;

    use crate::TRANSFORM_C14N_1_0;

    #[test]
    fn not_reset_asserts_in_use_state() {
        let doc = "<a/>".parse::<Document>().unwrap();
        let canonicalizer = Canonicalizer::new(TRANSFORM_C14N_1_0).unwrap();

        let mut out = Vec::new();
        canonicalizer
            .canonicalize(&doc, &AllVisible, None, &mut out)
            .unwrap();

        let mut other = Vec::new();
        assert!(canonicalizer
            .canonicalize(&doc, &AllVisible, None, &mut other)
            .is_err());

        canonicalizer.reset();
        assert!(canonicalizer
            .canonicalize(&doc, &AllVisible, None, &mut other)
            .is_ok());
    }

    #[test]
    fn transform_produces_octets() {
        let doc = "<a><b/></a>".parse::<Document>().unwrap();
        let transform = C14nTransform::new(TRANSFORM_C14N_1_0).unwrap();

        let data = Data::sub_tree(doc.document_element().unwrap(), true);
        let ctx = TransformContext::default();

        match transform.apply(&doc, data, &ctx).unwrap() {
            Data::Octets(octets) => assert_eq!(&octets.bytes[..], b"<a><b></b></a>"),
            x => panic!("unexpected data: {:?}", x),
        }
    }
}
