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

use std::collections::HashSet;

use xmldom::{Document, NodeId, XPath, XPathContext};

use crate::{sub_tree_set, Data, DataTypes, Error, NS_XMLDSIG, TRANSFORM_XPATH};

use super::{create_dsig_element, ns_bindings, Transform, TransformContext, NODE_XPATH};

/* XPathTransform */

/// XPath filter: keeps the nodes of the input set for which the
/// expression evaluates to true, with the node as context node.
pub struct XPathTransform {
    expression: String,
    bindings: Vec<(String, String)>,
}

impl XPathTransform {
    pub fn new<T: Into<String>>(expression: T) -> Self {
        Self {
            expression: expression.into(),
            bindings: Vec::new(),
        }
    }

    pub fn with_bindings(mut self, bindings: Vec<(String, String)>) -> Self {
        self.bindings = bindings;

        self
    }
}

impl Transform for XPathTransform {
    fn algorithm(&self) -> &str {
        TRANSFORM_XPATH
    }

    fn input_types(&self) -> DataTypes {
        DataTypes::Nodes
    }

    fn apply(&self, doc: &Document, data: Data, ctx: &TransformContext) -> Result<Data, Error> {
        let expression = XPath::parse(&self.expression)
            .map_err(|err| Error::TransformError(err.to_string()))?;

        let input: HashSet<NodeId> = match data {
            Data::NodeSet(set) => set.nodes,
            Data::SubTree(tree) => sub_tree_set(doc, tree.root, tree.exclude_comments),
            x => return Err(Error::UnexpectedDataType((&x).into())),
        };

        let xpath_ctx = XPathContext {
            here: ctx.here.clone(),
            namespaces: &self.bindings,
            ..XPathContext::default()
        };

        let mut nodes = HashSet::new();
        for node in input {
            let keep = expression
                .matches(doc, node, &xpath_ctx)
                .map_err(|err| Error::TransformError(err.to_string()))?;

            if keep {
                nodes.insert(node);
            }
        }

        Ok(Data::node_set(nodes))
    }

    fn write_params(&self, doc: &mut Document, element: NodeId) -> Result<(), Error> {
        let prefix = doc.qname(element).and_then(|name| name.prefix.clone());
        let xpath = create_dsig_element(doc, NODE_XPATH, prefix.as_deref());

        let text = doc.create_text(&self.expression);
        doc.append_child(xpath, text)?;
        doc.append_child(element, xpath)?;

        Ok(())
    }

    fn params_key(&self) -> String {
        self.expression.clone()
    }
}

pub(crate) fn factory(doc: &Document, element: NodeId) -> Result<Box<dyn Transform>, Error> {
    let mut child = doc.first_child(element).and_then(|n| doc.next_element(n));

    while let Some(candidate) = child {
        if doc.is_element_named(candidate, NODE_XPATH, NS_XMLDSIG)
            || doc.name(candidate) == Some(NODE_XPATH)
        {
            let expression = doc.content(candidate);
            let bindings = ns_bindings(doc, candidate);

            return Ok(Box::new(XPathTransform::new(expression).with_bindings(bindings)));
        }

        child = doc.next_sibling(candidate).and_then(|n| doc.next_element(n));
    }

    Err(Error::MarshalError(format!(
        "XPath transform is missing the '{}' child",
        NODE_XPATH
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    use xmldom::NodeKind;

    #[test]
    fn keeps_matching_text_nodes() {
        let doc = "<doc><CipherText Id=\"ct\">secret</CipherText><noise>x</noise></doc>"
            .parse::<Document>()
            .unwrap();

        let transform =
            XPathTransform::new("self::text()[parent::CipherText[@Id=\"ct\"]]");

        let input = Data::sub_tree(doc.document_element().unwrap(), true);
        match transform
            .apply(&doc, input, &TransformContext::default())
            .unwrap()
        {
            Data::NodeSet(set) => {
                assert_eq!(set.nodes.len(), 1);

                let node = *set.nodes.iter().next().unwrap();
                assert_eq!(doc.kind(node), NodeKind::Text);
                assert_eq!(doc.text(node), Some("secret"));
            }
            x => panic!("unexpected data: {:?}", x),
        }
    }

    #[test]
    fn invalid_expression_is_a_transform_error() {
        let doc = "<a/>".parse::<Document>().unwrap();
        let transform = XPathTransform::new("count(//a)");
        let input = Data::sub_tree(doc.document_element().unwrap(), true);

        match transform.apply(&doc, input, &TransformContext::default()) {
            Err(Error::TransformError(_)) => (),
            x => panic!("unexpected result: {:?}", x),
        }
    }
}
