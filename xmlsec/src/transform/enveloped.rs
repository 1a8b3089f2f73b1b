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

use xmldom::{Document, NodeId};

use crate::{sub_tree_set, Data, DataTypes, Error, TRANSFORM_ENVELOPED_SIGNATURE};

use super::{Transform, TransformContext};

/* EnvelopedTransform */

/// Removes the enclosing `Signature` subtree from the node set.
pub struct EnvelopedTransform;

impl Transform for EnvelopedTransform {
    fn algorithm(&self) -> &str {
        TRANSFORM_ENVELOPED_SIGNATURE
    }

    fn input_types(&self) -> DataTypes {
        DataTypes::Nodes
    }

    fn apply(&self, doc: &Document, data: Data, ctx: &TransformContext) -> Result<Data, Error> {
        let signature = ctx.signature_node.ok_or_else(|| {
            Error::TransformError(
                "enveloped-signature transform requires an enclosing Signature".into(),
            )
        })?;

        let mut nodes = match data {
            Data::NodeSet(set) => set.nodes,
            Data::SubTree(tree) => sub_tree_set(doc, tree.root, tree.exclude_comments),
            x => return Err(Error::UnexpectedDataType((&x).into())),
        };

        for node in doc.descendants(signature) {
            nodes.remove(&node);
        }

        Ok(Data::node_set(nodes))
    }
}

pub(crate) fn factory(_doc: &Document, _element: NodeId) -> Result<Box<dyn Transform>, Error> {
    Ok(Box::new(EnvelopedTransform))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_signature_subtree() {
        let doc = "<a><data/><Signature><SignedInfo/></Signature></a>"
            .parse::<Document>()
            .unwrap();
        let signature = doc
            .search(doc.root(), &mut |d, n| d.name(n) == Some("Signature"))
            .unwrap();
        let data_el = doc
            .search(doc.root(), &mut |d, n| d.name(n) == Some("data"))
            .unwrap();

        let ctx = TransformContext {
            signature_node: Some(signature),
            ..TransformContext::default()
        };

        let input = Data::sub_tree(doc.document_element().unwrap(), true);
        match EnvelopedTransform.apply(&doc, input, &ctx).unwrap() {
            Data::NodeSet(set) => {
                assert!(set.nodes.contains(&data_el));
                assert!(!set.nodes.contains(&signature));
            }
            x => panic!("unexpected data: {:?}", x),
        }
    }

    #[test]
    fn requires_signature_context() {
        let doc = "<a/>".parse::<Document>().unwrap();
        let input = Data::sub_tree(doc.document_element().unwrap(), true);

        assert!(EnvelopedTransform
            .apply(&doc, input, &TransformContext::default())
            .is_err());
    }
}
