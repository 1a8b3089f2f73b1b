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

use std::collections::HashMap;
use std::fmt::Write as FmtWrite;
use std::str::{from_utf8, FromStr};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{Attribute, Error, NodeData, NodeId, NodeKind, NsDecl, Payload, QName};

/// Arena backed XML document.
///
/// Nodes are addressed by [`NodeId`] handles. The document node is always
/// id 0; detached nodes keep their slot but have no parent.
#[derive(Debug)]
pub struct Document {
    nodes: Vec<NodeData>,
    ids: HashMap<String, NodeId>,
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeData {
                parent: None,
                children: Vec::new(),
                payload: Payload::Document,
            }],
            ids: HashMap::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// The document element, i.e. the outermost element of the tree.
    pub fn document_element(&self) -> Option<NodeId> {
        self.nodes[0]
            .children
            .iter()
            .copied()
            .find(|id| self.kind(*id) == NodeKind::Element)
    }

    fn data(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0]
    }

    fn data_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.0]
    }

    fn push(&mut self, payload: Payload) -> NodeId {
        let id = NodeId(self.nodes.len());

        self.nodes.push(NodeData {
            parent: None,
            children: Vec::new(),
            payload,
        });

        id
    }

    /* Navigation */

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.data(id).payload.kind()
    }

    pub fn qname(&self, id: NodeId) -> Option<&QName> {
        match &self.data(id).payload {
            Payload::Element { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Local name of an element.
    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.qname(id).map(|name| name.local.as_str())
    }

    pub fn attrs(&self, id: NodeId) -> &[Attribute] {
        match &self.data(id).payload {
            Payload::Element { attrs, .. } => attrs,
            _ => &[],
        }
    }

    pub fn ns_decls(&self, id: NodeId) -> &[NsDecl] {
        match &self.data(id).payload {
            Payload::Element { ns_decls, .. } => ns_decls,
            _ => &[],
        }
    }

    /// Attribute value by local name, ignoring the attribute prefix.
    pub fn prop(&self, id: NodeId, name: &str) -> Option<&str> {
        self.attrs(id)
            .iter()
            .find(|attr| attr.name.local == name)
            .map(|attr| attr.value.as_str())
    }

    /// Literal content of a text, comment or processing instruction node.
    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.data(id).payload {
            Payload::Text(text) => Some(text),
            Payload::Comment(text) => Some(text),
            Payload::Pi { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Target of a processing instruction node.
    pub fn pi_target(&self, id: NodeId) -> Option<&str> {
        match &self.data(id).payload {
            Payload::Pi { target, .. } => Some(target),
            _ => None,
        }
    }

    /// XPath string value: the concatenation of all descendant text nodes.
    pub fn content(&self, id: NodeId) -> String {
        match &self.data(id).payload {
            Payload::Text(text) => text.clone(),
            Payload::Comment(text) => text.clone(),
            Payload::Pi { data, .. } => data.clone(),
            _ => {
                let mut ret = String::new();
                self.collect_text(id, &mut ret);

                ret
            }
        }
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        for child in self.children(id) {
            match &self.data(*child).payload {
                Payload::Text(text) => out.push_str(text),
                Payload::Element { .. } => self.collect_text(*child, out),
                _ => (),
            }
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.data(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.data(id).children
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.children(id).first().copied()
    }

    pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
        self.children(id).last().copied()
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent);
        let pos = siblings.iter().position(|s| *s == id)?;

        siblings.get(pos + 1).copied()
    }

    pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent);
        let pos = siblings.iter().position(|s| *s == id)?;

        if pos == 0 {
            None
        } else {
            siblings.get(pos - 1).copied()
        }
    }

    pub fn first_child_element(&self, id: NodeId) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|child| self.kind(*child) == NodeKind::Element)
    }

    /// The element itself if it is one, otherwise the next element sibling.
    pub fn next_element(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(n) = current {
            if self.kind(n) == NodeKind::Element {
                return Some(n);
            }

            current = self.next_sibling(n);
        }

        None
    }

    /// Preorder traversal of the subtree rooted at `id`, including `id`.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut ret = Vec::new();
        let mut stack = vec![id];

        while let Some(n) = stack.pop() {
            ret.push(n);

            for child in self.children(n).iter().rev() {
                stack.push(*child);
            }
        }

        ret
    }

    pub fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }

            current = self.parent(n);
        }

        false
    }

    /// First node in document order (starting at `from`) matching the
    /// predicate.
    pub fn search<F>(&self, from: NodeId, predicate: &mut F) -> Option<NodeId>
    where
        F: FnMut(&Document, NodeId) -> bool,
    {
        let mut stack = vec![from];
        while let Some(n) = stack.pop() {
            if predicate(self, n) {
                return Some(n);
            }

            for child in self.children(n).iter().rev() {
                stack.push(*child);
            }
        }

        None
    }

    /// Nearest ancestor-or-self matching the predicate.
    pub fn search_parent<F>(&self, from: NodeId, predicate: F) -> Option<NodeId>
    where
        F: Fn(&Document, NodeId) -> bool,
    {
        let mut current = Some(from);
        while let Some(n) = current {
            if predicate(self, n) {
                return Some(n);
            }

            current = self.parent(n);
        }

        None
    }

    pub fn is_element_named(&self, id: NodeId, name: &str, ns_href: &str) -> bool {
        if self.kind(id) != NodeKind::Element {
            return false;
        }

        if self.name(id) != Some(name) {
            return false;
        }

        self.ns_href(id).as_deref() == Some(ns_href)
    }

    pub fn find_element(&self, from: NodeId, name: &str, ns_href: &str) -> Option<NodeId> {
        self.search(from, &mut |doc, n| doc.is_element_named(n, name, ns_href))
    }

    /* IDs */

    /// Registers `value` as a DOM ID pointing at `node`.
    pub fn register_id(&mut self, value: &str, node: NodeId) {
        self.ids.insert(value.into(), node);
    }

    /// Resolves a registered DOM ID.
    pub fn element_by_id(&self, value: &str) -> Option<NodeId> {
        self.ids.get(value).copied()
    }

    /// Fallback lookup scanning for an `Id` attribute with the given value.
    pub fn find_by_id_attr(&self, value: &str) -> Option<NodeId> {
        self.search(self.root(), &mut |doc, n| {
            doc.kind(n) == NodeKind::Element && doc.prop(n, "Id") == Some(value)
        })
    }

    /* Mutation */

    pub fn create_element(&mut self, qname: &str) -> NodeId {
        self.push(Payload::Element {
            name: QName::parse(qname),
            attrs: Vec::new(),
            ns_decls: Vec::new(),
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(Payload::Text(text.into()))
    }

    pub fn create_comment(&mut self, text: &str) -> NodeId {
        self.push(Payload::Comment(text.into()))
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) -> Result<(), Error> {
        let qname = QName::parse(name);

        match &mut self.data_mut(id).payload {
            Payload::Element { attrs, .. } => {
                match attrs.iter_mut().find(|attr| attr.name == qname) {
                    Some(attr) => attr.value = value.into(),
                    None => attrs.push(Attribute {
                        name: qname,
                        value: value.into(),
                    }),
                }

                Ok(())
            }
            _ => Err(Error::NotAnElement),
        }
    }

    pub fn set_ns_decl(
        &mut self,
        id: NodeId,
        prefix: Option<&str>,
        href: &str,
    ) -> Result<(), Error> {
        match &mut self.data_mut(id).payload {
            Payload::Element { ns_decls, .. } => {
                match ns_decls
                    .iter_mut()
                    .find(|decl| decl.prefix.as_deref() == prefix)
                {
                    Some(decl) => decl.href = href.into(),
                    None => ns_decls.push(NsDecl {
                        prefix: prefix.map(Into::into),
                        href: href.into(),
                    }),
                }

                Ok(())
            }
            _ => Err(Error::NotAnElement),
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), Error> {
        if self.data(child).parent.is_some() {
            return Err(Error::NodeNotDetached);
        }

        self.data_mut(child).parent = Some(parent);
        self.data_mut(parent).children.push(child);

        Ok(())
    }

    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        anchor: NodeId,
    ) -> Result<(), Error> {
        if self.data(child).parent.is_some() {
            return Err(Error::NodeNotDetached);
        }

        let pos = self
            .data(parent)
            .children
            .iter()
            .position(|c| *c == anchor)
            .ok_or(Error::NodeNotAttached)?;

        self.data_mut(child).parent = Some(parent);
        self.data_mut(parent).children.insert(pos, child);

        Ok(())
    }

    /// Removes `id` from its parent. The node and its subtree stay valid.
    pub fn detach(&mut self, id: NodeId) -> Result<(), Error> {
        let parent = self.data(id).parent.ok_or(Error::NodeNotAttached)?;

        self.data_mut(parent).children.retain(|c| *c != id);
        self.data_mut(id).parent = None;

        Ok(())
    }

    /// Replaces `old` with `new` at the same position. `old` is detached.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> Result<(), Error> {
        if self.data(new).parent.is_some() {
            return Err(Error::NodeNotDetached);
        }

        let parent = self.data(old).parent.ok_or(Error::NodeNotAttached)?;
        let pos = self
            .data(parent)
            .children
            .iter()
            .position(|c| *c == old)
            .ok_or(Error::NodeNotAttached)?;

        self.data_mut(parent).children[pos] = new;
        self.data_mut(new).parent = Some(parent);
        self.data_mut(old).parent = None;

        Ok(())
    }

    pub fn remove_children(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.data_mut(id).children);
        for child in children {
            self.data_mut(child).parent = None;
        }
    }

    /// Deep copies a subtree from another document. The copy is detached.
    pub fn import(&mut self, other: &Document, node: NodeId) -> NodeId {
        let payload = match &other.data(node).payload {
            Payload::Document => Payload::Document,
            Payload::Element {
                name,
                attrs,
                ns_decls,
            } => Payload::Element {
                name: name.clone(),
                attrs: attrs.clone(),
                ns_decls: ns_decls.clone(),
            },
            Payload::Text(text) => Payload::Text(text.clone()),
            Payload::Comment(text) => Payload::Comment(text.clone()),
            Payload::Pi { target, data } => Payload::Pi {
                target: target.clone(),
                data: data.clone(),
            },
        };

        let id = self.push(payload);

        for child in other.children(node) {
            let imported = self.import(other, *child);

            self.data_mut(imported).parent = Some(id);
            self.data_mut(id).children.push(imported);
        }

        id
    }

    /* Serialization */

    /// Plain (non canonical) serialization of the subtree rooted at `id`.
    pub fn serialize_node(&self, id: NodeId) -> String {
        let mut ret = String::new();
        self.write_node(id, &mut ret);

        ret
    }

    pub fn to_xml(&self) -> String {
        self.serialize_node(self.root())
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        match &self.data(id).payload {
            Payload::Document => {
                for child in self.children(id) {
                    self.write_node(*child, out);
                }
            }
            Payload::Element {
                name,
                attrs,
                ns_decls,
            } => {
                let _ = write!(out, "<{}", name);

                for decl in ns_decls {
                    match &decl.prefix {
                        Some(prefix) => {
                            let _ = write!(out, " xmlns:{}=\"{}\"", prefix, escape_attr(&decl.href));
                        }
                        None => {
                            let _ = write!(out, " xmlns=\"{}\"", escape_attr(&decl.href));
                        }
                    }
                }

                for attr in attrs {
                    let _ = write!(out, " {}=\"{}\"", attr.name, escape_attr(&attr.value));
                }

                if self.children(id).is_empty() {
                    out.push_str("/>");
                } else {
                    out.push('>');

                    for child in self.children(id) {
                        self.write_node(*child, out);
                    }

                    let _ = write!(out, "</{}>", name);
                }
            }
            Payload::Text(text) => out.push_str(&escape_text(text)),
            Payload::Comment(text) => {
                let _ = write!(out, "<!--{}-->", text);
            }
            Payload::Pi { target, data } => {
                if data.is_empty() {
                    let _ = write!(out, "<?{}?>", target);
                } else {
                    let _ = write!(out, "<?{} {}?>", target, data);
                }
            }
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for Document {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut reader = Reader::from_str(s);
        reader.config_mut().expand_empty_elements = true;

        let mut doc = Document::new();
        let mut stack = vec![doc.root()];

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let id = doc.push_element(&start)?;
                    let parent = *stack.last().expect("document node");

                    doc.data_mut(id).parent = Some(parent);
                    doc.data_mut(parent).children.push(id);

                    stack.push(id);
                }
                Event::End(_) => {
                    if stack.len() > 1 {
                        stack.pop();
                    }
                }
                Event::Empty(start) => {
                    // not emitted while expand_empty_elements is set
                    let id = doc.push_element(&start)?;
                    let parent = *stack.last().expect("document node");

                    doc.data_mut(id).parent = Some(parent);
                    doc.data_mut(parent).children.push(id);
                }
                Event::Text(text) => {
                    let text = text.unescape()?;
                    if !text.is_empty() && stack.len() > 1 {
                        let id = doc.push(Payload::Text(text.into_owned()));
                        let parent = *stack.last().expect("document node");

                        doc.data_mut(id).parent = Some(parent);
                        doc.data_mut(parent).children.push(id);
                    }
                }
                Event::CData(data) => {
                    let text = from_utf8(data.as_ref())?.to_owned();
                    let parent = *stack.last().expect("document node");
                    let id = doc.push(Payload::Text(text));

                    doc.data_mut(id).parent = Some(parent);
                    doc.data_mut(parent).children.push(id);
                }
                Event::Comment(comment) => {
                    let text = from_utf8(comment.as_ref())?.to_owned();
                    let parent = *stack.last().expect("document node");
                    let id = doc.push(Payload::Comment(text));

                    doc.data_mut(id).parent = Some(parent);
                    doc.data_mut(parent).children.push(id);
                }
                Event::PI(pi) => {
                    let target = from_utf8(pi.target())?.to_owned();
                    let data = from_utf8(pi.content())?.trim_start().to_owned();
                    let parent = *stack.last().expect("document node");
                    let id = doc.push(Payload::Pi { target, data });

                    doc.data_mut(id).parent = Some(parent);
                    doc.data_mut(parent).children.push(id);
                }
                Event::Decl(_) | Event::DocType(_) => (),
                Event::Eof => break,
            }
        }

        if doc.document_element().is_none() {
            return Err(Error::NoRootElement);
        }

        Ok(doc)
    }
}

impl Document {
    fn push_element(&mut self, start: &BytesStart) -> Result<NodeId, Error> {
        let name = QName::parse(from_utf8(start.name().as_ref())?);

        let mut attrs = Vec::new();
        let mut ns_decls = Vec::new();

        for attr in start.attributes() {
            let attr = attr?;
            let key = from_utf8(attr.key.as_ref())?.to_owned();
            let value = attr
                .unescape_value()
                .map_err(|err| Error::ParseError(err.to_string()))?
                .into_owned();

            if key == "xmlns" {
                ns_decls.push(NsDecl {
                    prefix: None,
                    href: value,
                });
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                ns_decls.push(NsDecl {
                    prefix: Some(prefix.into()),
                    href: value,
                });
            } else {
                attrs.push(Attribute {
                    name: QName::parse(&key),
                    value,
                });
            }
        }

        Ok(self.push(Payload::Element {
            name,
            attrs,
            ns_decls,
        }))
    }
}

fn escape_text(s: &str) -> String {
    let mut ret = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => ret.push_str("&amp;"),
            '<' => ret.push_str("&lt;"),
            '>' => ret.push_str("&gt;"),
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
            _ => ret.push(c),
        }
    }

    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_navigate() {
        let doc = "<a x=\"1\"><b>hi</b><!--c--></a>".parse::<Document>().unwrap();
        let root = doc.document_element().unwrap();

        assert_eq!(doc.name(root), Some("a"));
        assert_eq!(doc.prop(root, "x"), Some("1"));

        let b = doc.first_child_element(root).unwrap();
        assert_eq!(doc.name(b), Some("b"));
        assert_eq!(doc.content(b), "hi");

        let comment = doc.next_sibling(b).unwrap();
        assert_eq!(doc.kind(comment), NodeKind::Comment);
        assert_eq!(doc.text(comment), Some("c"));
    }

    #[test]
    fn namespaces_nearest_wins() {
        let doc = "<a xmlns=\"urn:outer\" xmlns:p=\"urn:p\"><p:b xmlns=\"urn:inner\"><c/></p:b></a>"
            .parse::<Document>()
            .unwrap();

        let a = doc.document_element().unwrap();
        let b = doc.first_child_element(a).unwrap();
        let c = doc.first_child_element(b).unwrap();

        assert_eq!(doc.ns_href(a).as_deref(), Some("urn:outer"));
        assert_eq!(doc.ns_href(b).as_deref(), Some("urn:p"));
        assert_eq!(doc.ns_href(c).as_deref(), Some("urn:inner"));

        let in_scope = doc.in_scope_namespaces(c);
        assert!(in_scope
            .iter()
            .any(|d| d.prefix.is_none() && d.href == "urn:inner"));
        assert!(in_scope
            .iter()
            .any(|d| d.prefix.as_deref() == Some("p") && d.href == "urn:p"));
        assert!(!in_scope.iter().any(|d| d.href == "urn:outer"));
    }

    #[test]
    fn mutate_and_serialize() {
        let mut doc = "<a><b>hi</b></a>".parse::<Document>().unwrap();
        let a = doc.document_element().unwrap();
        let b = doc.first_child_element(a).unwrap();

        let c = doc.create_element("c");
        let text = doc.create_text("2 < 3");
        doc.append_child(c, text).unwrap();
        doc.replace_node(b, c).unwrap();

        assert_eq!(doc.to_xml(), "<a><c>2 &lt; 3</c></a>");
        assert_eq!(doc.parent(b), None);
    }

    #[test]
    fn import_subtree() {
        let src = "<x><y z=\"1\">t</y></x>".parse::<Document>().unwrap();
        let y = doc_find(&src, "y");

        let mut dst = "<a/>".parse::<Document>().unwrap();
        let a = dst.document_element().unwrap();
        let imported = dst.import(&src, y);
        dst.append_child(a, imported).unwrap();

        assert_eq!(dst.to_xml(), "<a><y z=\"1\">t</y></a>");
    }

    fn doc_find(doc: &Document, name: &str) -> NodeId {
        doc.search(doc.root(), &mut |d, n| d.name(n) == Some(name))
            .unwrap()
    }
}
