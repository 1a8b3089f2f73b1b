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

mod base64;
mod c14n;
mod enveloped;
mod xpath;
mod xpath2;

use xmldom::{Document, Here, NodeId, NodeKind};

use crate::{
    Context, Data, DataTypes, Error, OctetSink, Registry, TransformFactory,
    NS_XMLDSIG, SECURE_VALIDATION_MAX_TRANSFORMS, TRANSFORM_BASE64, TRANSFORM_C14N_1_0,
    TRANSFORM_C14N_1_0_WITH_COMMENTS, TRANSFORM_C14N_1_1, TRANSFORM_C14N_1_1_WITH_COMMENTS,
    TRANSFORM_C14N_EXCLUSIVE, TRANSFORM_C14N_EXCLUSIVE_WITH_COMMENTS,
    TRANSFORM_ENVELOPED_SIGNATURE, TRANSFORM_XPATH, TRANSFORM_XPATH2,
};

pub use self::base64::*;
pub use self::xpath::*;
pub use c14n::*;
pub use enveloped::*;
pub use xpath2::*;

pub const NODE_TRANSFORMS: &str = "Transforms";
pub const NODE_TRANSFORM: &str = "Transform";
pub const NODE_XPATH: &str = "XPath";
pub const PROP_ALGORITHM: &str = "Algorithm";

/// Evaluation context handed to every transform of a chain.
#[derive(Default)]
pub struct TransformContext {
    /// Enclosing `Signature` element, required by the enveloped-signature
    /// transform.
    pub signature_node: Option<NodeId>,

    /// The attribute node carrying the reference URI (`here()`).
    pub here: Option<Here>,

    /// Selects C14N 1.1 for the implicit canonicalization step.
    pub use_c14n11: bool,
}

impl TransformContext {
    pub fn from_context(ctx: &Context) -> Self {
        Self {
            use_c14n11: ctx.use_c14n11,
            ..Self::default()
        }
    }
}

/// A URI-identified, ordered operation on a [`Data`] value.
///
/// Non-terminal transforms map `Data` to `Data`; the terminal element of a
/// chain streams its octets into an [`OctetSink`] instead.
pub trait Transform {
    fn algorithm(&self) -> &str;

    fn input_types(&self) -> DataTypes;

    /// True if the transform can be the terminal (streaming) invocation.
    fn terminal_capable(&self) -> bool {
        false
    }

    fn apply(&self, doc: &Document, data: Data, ctx: &TransformContext) -> Result<Data, Error>;

    fn apply_terminal(
        &self,
        doc: &Document,
        data: Data,
        ctx: &TransformContext,
        sink: &mut dyn OctetSink,
    ) -> Result<(), Error> {
        match self.apply(doc, data, ctx)? {
            Data::Octets(octets) => sink.write_octets(&octets.bytes),
            x => Err(Error::InvalidDataType {
                actual: Some((&x).into()),
                expected: DataTypes::Octets,
            }),
        }
    }

    /// Writes algorithm specific children onto the marshaled `Transform`
    /// element.
    fn write_params(&self, _doc: &mut Document, _element: NodeId) -> Result<(), Error> {
        Ok(())
    }

    /// Stable textual form of the parameters, used for structural
    /// equality of references.
    fn params_key(&self) -> String {
        String::new()
    }
}

/// Ordered transform pipeline of a reference.
#[derive(Default)]
pub struct TransformChain {
    transforms: Vec<Box<dyn Transform>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transform: Box<dyn Transform>) -> &mut Self {
        self.transforms.push(transform);

        self
    }

    pub fn transforms(&self) -> &[Box<dyn Transform>] {
        &self.transforms
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// True if any member is a canonicalization transform.
    pub fn has_c14n(&self) -> bool {
        self.transforms
            .iter()
            .any(|t| Registry::global().lookup_canonicalizer(t.algorithm()).is_ok())
    }

    /// Runs the chain over `data`, streaming the terminal octets into
    /// `sink`. If the last transform leaves a node set, the implicit
    /// canonicalization step (C14N 1.0, or 1.1 under `use_c14n11`) is
    /// appended.
    pub fn execute(
        &self,
        doc: &Document,
        data: Data,
        ctx: &TransformContext,
        sink: &mut dyn OctetSink,
    ) -> Result<(), Error> {
        let mut data = data;
        let count = self.transforms.len();

        for (index, transform) in self.transforms.iter().enumerate() {
            let actual = (&data).into();
            if !transform.input_types().has(&actual) {
                return Err(Error::InvalidDataType {
                    actual: Some(actual),
                    expected: transform.input_types(),
                });
            }

            if index + 1 == count && transform.terminal_capable() {
                return transform.apply_terminal(doc, data, ctx, sink);
            }

            data = transform.apply(doc, data, ctx)?;
        }

        match data {
            Data::Octets(octets) => sink.write_octets(&octets.bytes),
            nodes => {
                let uri = if ctx.use_c14n11 {
                    TRANSFORM_C14N_1_1
                } else {
                    TRANSFORM_C14N_1_0
                };

                let c14n = C14nTransform::new(uri)?;

                c14n.apply_terminal(doc, nodes, ctx, sink)
            }
        }
    }

    /// Reads an ordered chain from a `Transforms` element. Under secure
    /// validation the chain length is capped.
    pub fn unmarshal(
        doc: &Document,
        transforms_element: NodeId,
        secure_validation: bool,
    ) -> Result<Self, Error> {
        let mut transforms = Vec::new();

        let mut child = doc
            .first_child(transforms_element)
            .and_then(|n| doc.next_element(n));

        while let Some(element) = child {
            if !doc.is_element_named(element, NODE_TRANSFORM, NS_XMLDSIG) {
                return Err(Error::MarshalError(format!(
                    "unexpected element '{}' in '{}'",
                    doc.name(element).unwrap_or("<unknown>"),
                    NODE_TRANSFORMS
                )));
            }

            let algorithm = doc.prop(element, PROP_ALGORITHM).ok_or_else(|| {
                Error::MarshalError(format!(
                    "element '{}' is missing the '{}' property",
                    NODE_TRANSFORM, PROP_ALGORITHM
                ))
            })?;

            let transform_factory = Registry::global().lookup_transform(algorithm)?;

            transforms.push(transform_factory(doc, element)?);

            if secure_validation && transforms.len() > SECURE_VALIDATION_MAX_TRANSFORMS {
                return Err(Error::MarshalError(format!(
                    "maximum number of transforms ({}) exceeded",
                    SECURE_VALIDATION_MAX_TRANSFORMS
                )));
            }

            child = doc.next_sibling(element).and_then(|n| doc.next_element(n));
        }

        Ok(Self { transforms })
    }

    /// Emits the chain as `Transform` children of `transforms_element`.
    pub fn marshal_into(
        &self,
        doc: &mut Document,
        transforms_element: NodeId,
        prefix: Option<&str>,
    ) -> Result<(), Error> {
        for transform in &self.transforms {
            let element = create_dsig_element(doc, NODE_TRANSFORM, prefix);
            doc.set_attr(element, PROP_ALGORITHM, transform.algorithm())?;
            doc.append_child(transforms_element, element)?;

            transform.write_params(doc, element)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list()
            .entries(self.transforms.iter().map(|t| t.algorithm()))
            .finish()
    }
}

impl PartialEq for TransformChain {
    fn eq(&self, other: &Self) -> bool {
        if self.transforms.len() != other.transforms.len() {
            return false;
        }

        self.transforms.iter().zip(&other.transforms).all(|(a, b)| {
            a.algorithm() == b.algorithm() && a.params_key() == b.params_key()
        })
    }
}

pub(crate) fn create_dsig_element(doc: &mut Document, name: &str, prefix: Option<&str>) -> NodeId {
    match prefix {
        Some(prefix) => doc.create_element(&format!("{}:{}", prefix, name)),
        None => doc.create_element(name),
    }
}

/// Built-in transform factories, keyed by algorithm URI.
pub(crate) fn builtin_factory(uri: &str) -> Option<TransformFactory> {
    match uri {
        TRANSFORM_C14N_1_0
        | TRANSFORM_C14N_1_0_WITH_COMMENTS
        | TRANSFORM_C14N_1_1
        | TRANSFORM_C14N_1_1_WITH_COMMENTS
        | TRANSFORM_C14N_EXCLUSIVE
        | TRANSFORM_C14N_EXCLUSIVE_WITH_COMMENTS => Some(c14n::factory),
        TRANSFORM_BASE64 => Some(base64::factory),
        TRANSFORM_ENVELOPED_SIGNATURE => Some(enveloped::factory),
        TRANSFORM_XPATH => Some(xpath::factory),
        TRANSFORM_XPATH2 => Some(xpath2::factory),
        _ => None,
    }
}

/// Collects the namespace bindings in scope at `element` for XPath
/// evaluation.
pub(crate) fn ns_bindings(doc: &Document, element: NodeId) -> Vec<(String, String)> {
    doc.in_scope_namespaces(element)
        .into_iter()
        .filter_map(|decl| decl.prefix.clone().map(|prefix| (prefix, decl.href)))
        .collect()
}

/// Concatenated text content of a node set in document order.
pub(crate) fn node_set_text(doc: &Document, data: &Data) -> Result<String, Error> {
    match data {
        Data::SubTree(tree) => Ok(doc.content(tree.root)),
        Data::NodeSet(set) => {
            let mut ret = String::new();

            for node in doc.descendants(doc.root()) {
                if doc.kind(node) == NodeKind::Text && set.nodes.contains(&node) {
                    if let Some(text) = doc.text(node) {
                        ret.push_str(text);
                    }
                }
            }

            Ok(ret)
        }
        Data::Octets(_) => Err(Error::UnexpectedDataType(data.into())),
    }
}
