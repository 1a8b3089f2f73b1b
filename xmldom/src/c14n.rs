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

use std::collections::BTreeSet;
use std::io::Write;

use super::{Document, Error, NodeId, NodeKind, NsDecl};

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum C14nMode {
    C14n_1_0,
    C14n_1_1,
    C14n_Exclusive_1_0,
}

/// Decides which nodes of the document take part in canonicalization.
///
/// Attributes and namespace declarations follow their owning element.
pub trait NodeVisibility {
    fn is_visible(&self, doc: &Document, node: NodeId) -> bool;
}

pub struct AllVisible;

impl NodeVisibility for AllVisible {
    fn is_visible(&self, _doc: &Document, _node: NodeId) -> bool {
        true
    }
}

impl Document {
    /// Canonicalizes the document subset selected by `visibility` into
    /// `out` using the given algorithm.
    pub fn c14n(
        &self,
        visibility: &dyn NodeVisibility,
        mode: C14nMode,
        with_comments: bool,
        inclusive_ns_prefixes: Option<&[String]>,
        out: &mut dyn Write,
    ) -> Result<(), Error> {
        let mut serializer = Serializer {
            doc: self,
            visibility,
            mode,
            with_comments,
            inclusive_ns_prefixes,
            out,
            rendered: Vec::new(),
        };

        serializer.document(self.root())
    }
}

struct Serializer<'a> {
    doc: &'a Document,
    visibility: &'a dyn NodeVisibility,
    mode: C14nMode,
    with_comments: bool,
    inclusive_ns_prefixes: Option<&'a [String]>,
    out: &'a mut dyn Write,
    rendered: Vec<Vec<NsDecl>>,
}

impl Serializer<'_> {
    fn document(&mut self, root: NodeId) -> Result<(), Error> {
        let children = self.doc.children(root).to_vec();
        let doc_element = self.doc.document_element();
        let mut before_root = true;

        for child in children {
            if Some(child) == doc_element {
                before_root = false;
                self.node(child)?;

                continue;
            }

            match self.doc.kind(child) {
                NodeKind::Comment if self.with_comments && self.visible(child) => {
                    if !before_root {
                        self.out.write_all(b"\n")?;
                    }

                    self.comment(child)?;

                    if before_root {
                        self.out.write_all(b"\n")?;
                    }
                }
                NodeKind::Pi if self.visible(child) => {
                    if !before_root {
                        self.out.write_all(b"\n")?;
                    }

                    self.pi(child)?;

                    if before_root {
                        self.out.write_all(b"\n")?;
                    }
                }
                _ => (),
            }
        }

        Ok(())
    }

    fn visible(&self, node: NodeId) -> bool {
        self.visibility.is_visible(self.doc, node)
    }

    fn node(&mut self, node: NodeId) -> Result<(), Error> {
        match self.doc.kind(node) {
            NodeKind::Element => self.element(node),
            NodeKind::Text => {
                if self.visible(node) {
                    let text = self.doc.text(node).unwrap_or_default();
                    self.out.write_all(escape_text(text).as_bytes())?;
                }

                Ok(())
            }
            NodeKind::Comment => {
                if self.with_comments && self.visible(node) {
                    self.comment(node)?;
                }

                Ok(())
            }
            NodeKind::Pi => {
                if self.visible(node) {
                    self.pi(node)?;
                }

                Ok(())
            }
            NodeKind::Document => self.document(node),
        }
    }

    fn comment(&mut self, node: NodeId) -> Result<(), Error> {
        let text = self.doc.text(node).unwrap_or_default();

        self.out.write_all(b"<!--")?;
        self.out.write_all(text.as_bytes())?;
        self.out.write_all(b"-->")?;

        Ok(())
    }

    fn pi(&mut self, node: NodeId) -> Result<(), Error> {
        let target = self.doc.pi_target(node).unwrap_or_default().to_owned();
        let data = self.doc.text(node).unwrap_or_default().to_owned();

        self.out.write_all(b"<?")?;
        self.out.write_all(target.as_bytes())?;

        if !data.is_empty() {
            self.out.write_all(b" ")?;
            self.out.write_all(data.as_bytes())?;
        }

        self.out.write_all(b"?>")?;

        Ok(())
    }

    fn element(&mut self, node: NodeId) -> Result<(), Error> {
        let visible = self.visible(node);

        if !visible {
            for child in self.doc.children(node).to_vec() {
                self.node(child)?;
            }

            return Ok(());
        }

        let qname = self
            .doc
            .qname(node)
            .ok_or_else(|| Error::C14nFailed("element without name".into()))?
            .to_string();

        let to_render = match self.mode {
            C14nMode::C14n_1_0 | C14nMode::C14n_1_1 => self.inclusive_namespaces(node),
            C14nMode::C14n_Exclusive_1_0 => self.exclusive_namespaces(node),
        };

        self.out.write_all(b"<")?;
        self.out.write_all(qname.as_bytes())?;

        for decl in &to_render {
            match &decl.prefix {
                Some(prefix) => {
                    self.out.write_all(b" xmlns:")?;
                    self.out.write_all(prefix.as_bytes())?;
                }
                None => self.out.write_all(b" xmlns")?,
            }

            self.out.write_all(b"=\"")?;
            self.out.write_all(escape_attr(&decl.href).as_bytes())?;
            self.out.write_all(b"\"")?;
        }

        let mut attrs = self.doc.attrs(node).to_vec();
        attrs.sort_by(|a, b| {
            let ns_a = self.attr_ns(node, a.name.prefix.as_deref());
            let ns_b = self.attr_ns(node, b.name.prefix.as_deref());

            (ns_a, &a.name.local).cmp(&(ns_b, &b.name.local))
        });

        for attr in &attrs {
            self.out.write_all(b" ")?;
            self.out.write_all(attr.name.to_string().as_bytes())?;
            self.out.write_all(b"=\"")?;
            self.out.write_all(escape_attr(&attr.value).as_bytes())?;
            self.out.write_all(b"\"")?;
        }

        self.out.write_all(b">")?;

        self.rendered.push(to_render);

        for child in self.doc.children(node).to_vec() {
            self.node(child)?;
        }

        self.rendered.pop();

        self.out.write_all(b"</")?;
        self.out.write_all(qname.as_bytes())?;
        self.out.write_all(b">")?;

        Ok(())
    }

    fn attr_ns(&self, node: NodeId, prefix: Option<&str>) -> String {
        match prefix {
            // attributes without a prefix carry no namespace
            None => String::new(),
            Some(prefix) => self
                .doc
                .resolve_prefix(node, Some(prefix))
                .unwrap_or_default(),
        }
    }

    fn nearest_rendered(&self, prefix: Option<&str>) -> Option<&str> {
        for frame in self.rendered.iter().rev() {
            for decl in frame {
                if decl.prefix.as_deref() == prefix {
                    return Some(&decl.href);
                }
            }
        }

        None
    }

    fn inclusive_namespaces(&self, node: NodeId) -> Vec<NsDecl> {
        let in_scope = self.doc.in_scope_namespaces(node);
        let mut ret = Vec::new();

        for decl in &in_scope {
            if decl.prefix.as_deref() == Some("xml") {
                continue;
            }

            if self.nearest_rendered(decl.prefix.as_deref()) != Some(decl.href.as_str()) {
                ret.push(decl.clone());
            }
        }

        let has_default = in_scope.iter().any(|decl| decl.prefix.is_none());
        if !has_default {
            if let Some(rendered) = self.nearest_rendered(None) {
                if !rendered.is_empty() {
                    ret.push(NsDecl {
                        prefix: None,
                        href: String::new(),
                    });
                }
            }
        }

        sort_ns(&mut ret);

        ret
    }

    fn exclusive_namespaces(&self, node: NodeId) -> Vec<NsDecl> {
        let mut utilized: BTreeSet<Option<String>> = BTreeSet::new();

        if let Some(name) = self.doc.qname(node) {
            utilized.insert(name.prefix.clone());
        }

        for attr in self.doc.attrs(node) {
            if let Some(prefix) = &attr.name.prefix {
                if prefix != "xml" {
                    utilized.insert(Some(prefix.clone()));
                }
            }
        }

        if let Some(inclusive) = self.inclusive_ns_prefixes {
            for prefix in inclusive {
                if prefix == "#default" {
                    utilized.insert(None);
                } else {
                    utilized.insert(Some(prefix.clone()));
                }
            }
        }

        let mut ret = Vec::new();

        for prefix in utilized {
            match self.doc.resolve_prefix(node, prefix.as_deref()) {
                Some(href) => {
                    if self.nearest_rendered(prefix.as_deref()) != Some(href.as_str()) {
                        ret.push(NsDecl { prefix, href });
                    }
                }
                None if prefix.is_none() => {
                    if let Some(rendered) = self.nearest_rendered(None) {
                        if !rendered.is_empty() {
                            ret.push(NsDecl {
                                prefix: None,
                                href: String::new(),
                            });
                        }
                    }
                }
                None => (),
            }
        }

        sort_ns(&mut ret);

        ret
    }
}

fn sort_ns(decls: &mut Vec<NsDecl>) {
    decls.sort_by(|a, b| a.prefix.cmp(&b.prefix));
}

fn escape_text(s: &str) -> String {
    let mut ret = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => ret.push_str("&amp;"),
            '<' => ret.push_str("&lt;"),
            '>' => ret.push_str("&gt;"),
            '\r' => ret.push_str("&#xD;"),
            _ => ret.push(c),
        }
    }

    ret
}

fn escape_attr(s: &str) -> String {
    let mut ret = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => ret.push_str("&amp;"),
            '<' => ret.push_str("&lt;"),
            '"' => ret.push_str("&quot;"),
            '\t' => ret.push_str("&#x9;"),
            '\n' => ret.push_str("&#xA;"),
            '\r' => ret.push_str("&#xD;"),
            _ => ret.push(c),
        }
    }

    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::from_utf8;

    fn c14n(doc: &Document, vis: &dyn NodeVisibility, mode: C14nMode, comments: bool) -> String {
        let mut out = Vec::new();
        doc.c14n(vis, mode, comments, None, &mut out).unwrap();

        from_utf8(&out).unwrap().to_owned()
    }

    #[test]
    fn attribute_ordering() {
        let doc = "<e b=\"2\" a=\"1\" c=\"3\"/>".parse::<Document>().unwrap();

        assert_eq!(
            c14n(&doc, &AllVisible, C14nMode::C14n_1_0, false),
            "<e a=\"1\" b=\"2\" c=\"3\"></e>"
        );
    }

    #[test]
    fn empty_element_expands() {
        let doc = "<doc><a/><b></b></doc>".parse::<Document>().unwrap();

        assert_eq!(
            c14n(&doc, &AllVisible, C14nMode::C14n_1_0, false),
            "<doc><a></a><b></b></doc>"
        );
    }

    #[test]
    fn comments_stripped_without_flag() {
        let doc = "<doc><!--x-->t</doc>".parse::<Document>().unwrap();

        assert_eq!(
            c14n(&doc, &AllVisible, C14nMode::C14n_1_0, false),
            "<doc>t</doc>"
        );
        assert_eq!(
            c14n(&doc, &AllVisible, C14nMode::C14n_1_0, true),
            "<doc><!--x-->t</doc>"
        );
    }

    #[test]
    fn inherited_namespace_not_redeclared() {
        let doc = "<a xmlns=\"urn:x\"><b><c/></b></a>".parse::<Document>().unwrap();

        assert_eq!(
            c14n(&doc, &AllVisible, C14nMode::C14n_1_0, false),
            "<a xmlns=\"urn:x\"><b><c></c></b></a>"
        );
    }

    #[test]
    fn exclusive_drops_unused_prefixes() {
        let doc = "<a xmlns:u=\"urn:unused\" xmlns:p=\"urn:p\"><p:b/></a>"
            .parse::<Document>()
            .unwrap();

        assert_eq!(
            c14n(&doc, &AllVisible, C14nMode::C14n_Exclusive_1_0, false),
            "<a><p:b xmlns:p=\"urn:p\"></p:b></a>"
        );
    }

    #[test]
    fn invisible_element_children_survive() {
        let doc = "<doc><skip><keep>t</keep></skip></doc>".parse::<Document>().unwrap();

        struct SkipByName;

        impl NodeVisibility for SkipByName {
            fn is_visible(&self, doc: &Document, node: NodeId) -> bool {
                doc.name(node) != Some("skip")
            }
        }

        assert_eq!(
            c14n(&doc, &SkipByName, C14nMode::C14n_1_0, false),
            "<doc><keep>t</keep></doc>"
        );
    }

    #[test]
    fn text_escaping() {
        let doc = "<e>a &amp; b &lt; c</e>".parse::<Document>().unwrap();

        assert_eq!(
            c14n(&doc, &AllVisible, C14nMode::C14n_1_0, false),
            "<e>a &amp; b &lt; c</e>"
        );
    }
}
