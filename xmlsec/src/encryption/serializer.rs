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

use std::fmt::Write as FmtWrite;

use xmldom::{Document, NodeId, NodeVisibility};

use crate::{Canonicalizer, Data, DataVisibility, Error};

/// Serializes plaintext elements and content through the configured
/// canonicalizer, and parses decrypted octets back into nodes inside the
/// namespace context of the decryption target.
pub struct DocumentSerializer {
    canonicalizer: Canonicalizer,
}

impl DocumentSerializer {
    pub fn new(canonicalizer_uri: &str) -> Result<Self, Error> {
        Ok(Self {
            canonicalizer: Canonicalizer::new(canonicalizer_uri)?,
        })
    }

    pub fn canonicalizer_uri(&self) -> &str {
        self.canonicalizer.uri()
    }

    /// Serializes the element including its subtree.
    pub fn serialize_element(&self, doc: &Document, element: NodeId) -> Result<Vec<u8>, Error> {
        let data = Data::sub_tree(element, false);
        let visibility = DataVisibility::new(&data)?;

        let mut octets = Vec::new();
        self.canonicalizer
            .canonicalize_reset(doc, &visibility, None, &mut octets)?;

        Ok(octets)
    }

    /// Serializes only the children of the element, in document order.
    pub fn serialize_content(&self, doc: &Document, element: NodeId) -> Result<Vec<u8>, Error> {
        let visibility = ContentVisibility { root: element };

        let mut octets = Vec::new();
        self.canonicalizer
            .canonicalize_reset(doc, &visibility, None, &mut octets)?;

        Ok(octets)
    }

    /// Parses a decrypted textual fragment in the namespace context of
    /// `context_node`: a synthetic wrapper element declares every binding
    /// visible on the ancestor chain, nearest binding wins. The parsed
    /// children are imported into `doc` and returned detached, in order.
    pub fn deserialize(
        &self,
        doc: &mut Document,
        context_node: NodeId,
        text: &str,
    ) -> Result<Vec<NodeId>, Error> {
        let mut wrapper = String::from("<wrapper");

        for decl in doc.in_scope_namespaces(context_node) {
            match &decl.prefix {
                Some(prefix) => {
                    let _ = write!(wrapper, " xmlns:{}=\"{}\"", prefix, escape_attr(&decl.href));
                }
                None => {
                    let _ = write!(wrapper, " xmlns=\"{}\"", escape_attr(&decl.href));
                }
            }
        }

        wrapper.push('>');
        wrapper.push_str(text);
        wrapper.push_str("</wrapper>");

        let fragment = wrapper
            .parse::<Document>()
            .map_err(|err| Error::EncryptionError(format!("unable to parse plaintext: {}", err)))?;
        let fragment_root = fragment
            .document_element()
            .ok_or_else(|| Error::EncryptionError("plaintext fragment is empty".into()))?;

        let bindings = fragment.ns_decls(fragment_root).to_vec();

        let mut imported = Vec::new();
        for child in fragment.children(fragment_root) {
            let node = doc.import(&fragment, *child);

            // materialize the wrapper bindings so the nodes keep their
            // namespaces wherever they are attached
            if doc.kind(node) == xmldom::NodeKind::Element {
                for decl in &bindings {
                    let declared = doc
                        .ns_decls(node)
                        .iter()
                        .any(|own| own.prefix == decl.prefix);

                    if !declared {
                        doc.set_ns_decl(node, decl.prefix.as_deref(), &decl.href)?;
                    }
                }
            }

            imported.push(node);
        }

        Ok(imported)
    }
}

struct ContentVisibility {
    root: NodeId,
}

impl NodeVisibility for ContentVisibility {
    fn is_visible(&self, doc: &Document, node: NodeId) -> bool {
        node != self.root && doc.is_ancestor_or_self(self.root, node)
    }
}

fn escape_attr(s: &str) -> String {
    let mut ret = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => ret.push_str("&amp;"),
            '<' => ret.push_str("&lt;"),
            '"' => ret.push_str("&quot;"),
            _ => ret.push(c),
        }
    }

    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::from_utf8;

    use crate::TRANSFORM_C14N_1_0_WITH_COMMENTS;

    fn serializer() -> DocumentSerializer {
        DocumentSerializer::new(TRANSFORM_C14N_1_0_WITH_COMMENTS).unwrap()
    }

    #[test]
    fn element_and_content_serialization() {
        let doc = "<a><b x=\"1\">hi</b><c/></a>".parse::<Document>().unwrap();
        let a = doc.document_element().unwrap();
        let b = doc.first_child_element(a).unwrap();

        let serializer = serializer();

        let element = serializer.serialize_element(&doc, b).unwrap();
        assert_eq!(from_utf8(&element).unwrap(), "<b x=\"1\">hi</b>");

        let content = serializer.serialize_content(&doc, a).unwrap();
        assert_eq!(from_utf8(&content).unwrap(), "<b x=\"1\">hi</b><c></c>");
    }

    #[test]
    fn deserialize_restores_ancestor_prefix_bindings() {
        let mut doc = "<root xmlns:p=\"urn:p\"><target/></root>"
            .parse::<Document>()
            .unwrap();
        let target = doc
            .search(doc.root(), &mut |d, n| d.name(n) == Some("target"))
            .unwrap();

        let serializer = serializer();
        let nodes = serializer
            .deserialize(&mut doc, target, "<p:item>x</p:item>")
            .unwrap();

        assert_eq!(nodes.len(), 1);
        assert_eq!(doc.name(nodes[0]), Some("item"));
        // the wrapper binding is materialized on the imported element
        assert_eq!(doc.ns_href(nodes[0]).as_deref(), Some("urn:p"));
    }

    #[test]
    fn nearest_binding_wins() {
        let mut doc =
            "<root xmlns:p=\"urn:outer\"><mid xmlns:p=\"urn:inner\"><target/></mid></root>"
                .parse::<Document>()
                .unwrap();
        let target = doc
            .search(doc.root(), &mut |d, n| d.name(n) == Some("target"))
            .unwrap();
        let mid = doc
            .search(doc.root(), &mut |d, n| d.name(n) == Some("mid"))
            .unwrap();

        let serializer = serializer();
        let nodes = serializer
            .deserialize(&mut doc, target, "<p:item/>")
            .unwrap();

        doc.append_child(mid, nodes[0]).unwrap();
        assert_eq!(doc.ns_href(nodes[0]).as_deref(), Some("urn:inner"));
    }
}
