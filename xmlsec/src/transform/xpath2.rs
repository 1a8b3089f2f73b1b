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

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use xmldom::{Document, Here, NodeId, XPath, XPathContext};

use crate::{sub_tree_set, Data, DataTypes, Error, NodeFilter, NS_XPATH_FILTER2, TRANSFORM_XPATH2};

use super::{ns_bindings, Transform, TransformContext, NODE_XPATH};

pub const PROP_FILTER: &str = "Filter";

/// Set operation of one XPath Filter 2.0 step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter2Op {
    Intersect,
    Subtract,
    Union,
}

impl Filter2Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intersect => "intersect",
            Self::Subtract => "subtract",
            Self::Union => "union",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "intersect" => Ok(Self::Intersect),
            "subtract" => Ok(Self::Subtract),
            "union" => Ok(Self::Union),
            x => Err(Error::MarshalError(format!(
                "unknown XPath filter operation '{}'",
                x
            ))),
        }
    }
}

/// One filter step: operation, expression and the namespace bindings in
/// scope at its `XPath` element.
#[derive(Debug, Clone)]
pub struct Filter2Entry {
    pub op: Filter2Op,
    pub expression: String,
    pub bindings: Vec<(String, String)>,
}

/* XPath2Filter */

/// Subtree membership filter combining the union, intersect and subtract
/// root sets:
///
/// * a node below a subtract root is dropped with its whole subtree,
/// * with a non-empty intersect set, a node outside of it is dropped (but
///   descended into) unless a union root covers it,
/// * everything else is kept.
///
/// The per-node subtree marks are memoized from the parent, keeping
/// canonicalization linear in the document size.
pub struct XPath2Filter {
    union_roots: HashSet<NodeId>,
    intersect_roots: HashSet<NodeId>,
    subtract_roots: HashSet<NodeId>,
    has_intersect: bool,
    marks: RefCell<HashMap<NodeId, (bool, bool, bool)>>,
}

impl XPath2Filter {
    /// Evaluates the filter expressions against the owner document.
    pub fn new(
        doc: &Document,
        entries: &[Filter2Entry],
        here: Option<&Here>,
    ) -> Result<Self, Error> {
        let mut union_roots = HashSet::new();
        let mut intersect_roots = HashSet::new();
        let mut subtract_roots = HashSet::new();
        let mut has_intersect = false;

        for entry in entries {
            let expression = XPath::parse(&entry.expression)
                .map_err(|err| Error::TransformError(err.to_string()))?;

            let ctx = XPathContext {
                here: here.cloned(),
                namespaces: &entry.bindings,
                ..XPathContext::default()
            };

            let roots = expression
                .eval(doc, &ctx)
                .map_err(|err| Error::TransformError(err.to_string()))?;

            match entry.op {
                Filter2Op::Union => union_roots.extend(roots),
                Filter2Op::Intersect => {
                    has_intersect = true;
                    intersect_roots.extend(roots);
                }
                Filter2Op::Subtract => subtract_roots.extend(roots),
            }
        }

        Ok(Self {
            union_roots,
            intersect_roots,
            subtract_roots,
            has_intersect,
            marks: RefCell::new(HashMap::new()),
        })
    }

    /// Membership decision: `-1` drop subtree, `0` drop node only, `1`
    /// keep.
    pub fn decide(&self, doc: &Document, node: NodeId) -> i8 {
        let (in_union, in_intersect, in_subtract) = self.mark(doc, node);

        if in_subtract {
            return -1;
        }

        if self.has_intersect && !in_intersect {
            if in_union {
                1
            } else {
                0
            }
        } else {
            1
        }
    }

    /// Whether `node` is below the shallowest enclosing root of each set.
    fn mark(&self, doc: &Document, node: NodeId) -> (bool, bool, bool) {
        if let Some(mark) = self.marks.borrow().get(&node) {
            return *mark;
        }

        let (mut in_union, mut in_intersect, mut in_subtract) = match doc.parent(node) {
            Some(parent) => self.mark(doc, parent),
            None => (false, false, false),
        };

        in_union |= self.union_roots.contains(&node);
        in_intersect |= self.intersect_roots.contains(&node);
        in_subtract |= self.subtract_roots.contains(&node);

        let mark = (in_union, in_intersect, in_subtract);
        self.marks.borrow_mut().insert(node, mark);

        mark
    }
}

impl NodeFilter for XPath2Filter {
    fn is_node_include(&self, doc: &Document, node: NodeId, _level: usize) -> i8 {
        self.decide(doc, node)
    }
}

/* XPath2Transform */

pub struct XPath2Transform {
    entries: Vec<Filter2Entry>,
}

impl XPath2Transform {
    pub fn new(entries: Vec<Filter2Entry>) -> Self {
        Self { entries }
    }

    pub fn entry<T: Into<String>>(op: Filter2Op, expression: T) -> Filter2Entry {
        Filter2Entry {
            op,
            expression: expression.into(),
            bindings: Vec::new(),
        }
    }
}

impl Transform for XPath2Transform {
    fn algorithm(&self) -> &str {
        TRANSFORM_XPATH2
    }

    fn input_types(&self) -> DataTypes {
        DataTypes::Nodes
    }

    fn apply(&self, doc: &Document, data: Data, ctx: &TransformContext) -> Result<Data, Error> {
        let filter = XPath2Filter::new(doc, &self.entries, ctx.here.as_ref())?;

        let input: HashSet<NodeId> = match data {
            Data::NodeSet(set) => set.nodes,
            Data::SubTree(tree) => sub_tree_set(doc, tree.root, tree.exclude_comments),
            x => return Err(Error::UnexpectedDataType((&x).into())),
        };

        let nodes = input
            .into_iter()
            .filter(|node| filter.decide(doc, *node) == 1)
            .collect();

        Ok(Data::node_set(nodes))
    }

    fn write_params(&self, doc: &mut Document, element: NodeId) -> Result<(), Error> {
        for entry in &self.entries {
            let xpath = doc.create_element(NODE_XPATH);
            doc.set_ns_decl(xpath, None, NS_XPATH_FILTER2)?;
            doc.set_attr(xpath, PROP_FILTER, entry.op.as_str())?;

            let text = doc.create_text(&entry.expression);
            doc.append_child(xpath, text)?;
            doc.append_child(element, xpath)?;
        }

        Ok(())
    }

    fn params_key(&self) -> String {
        self.entries
            .iter()
            .map(|entry| format!("{}:{}", entry.op.as_str(), entry.expression))
            .collect::<Vec<_>>()
            .join("|")
    }
}

pub(crate) fn factory(doc: &Document, element: NodeId) -> Result<Box<dyn Transform>, Error> {
    let mut entries = Vec::new();

    let mut child = doc.first_child(element).and_then(|n| doc.next_element(n));
    while let Some(candidate) = child {
        if doc.is_element_named(candidate, NODE_XPATH, NS_XPATH_FILTER2) {
            let filter = doc.prop(candidate, PROP_FILTER).ok_or_else(|| {
                Error::MarshalError(format!(
                    "element '{}' is missing the '{}' property",
                    NODE_XPATH, PROP_FILTER
                ))
            })?;

            entries.push(Filter2Entry {
                op: Filter2Op::parse(filter)?,
                expression: doc.content(candidate),
                bindings: ns_bindings(doc, candidate),
            });
        }

        child = doc.next_sibling(candidate).and_then(|n| doc.next_element(n));
    }

    if entries.is_empty() {
        return Err(Error::MarshalError(format!(
            "XPath Filter 2.0 transform without '{}' children",
            NODE_XPATH
        )));
    }

    Ok(Box::new(XPath2Transform::new(entries)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_for(doc: &Document, entries: Vec<Filter2Entry>) -> XPath2Filter {
        XPath2Filter::new(doc, &entries, None).unwrap()
    }

    #[test]
    fn subtract_prunes_subtree() {
        let doc = "<doc><a/><b><x/></b></doc>".parse::<Document>().unwrap();
        let filter = filter_for(
            &doc,
            vec![XPath2Transform::entry(Filter2Op::Subtract, "//b")],
        );

        let a = doc.search(doc.root(), &mut |d, n| d.name(n) == Some("a")).unwrap();
        let b = doc.search(doc.root(), &mut |d, n| d.name(n) == Some("b")).unwrap();
        let x = doc.search(doc.root(), &mut |d, n| d.name(n) == Some("x")).unwrap();

        assert_eq!(filter.decide(&doc, a), 1);
        assert_eq!(filter.decide(&doc, b), -1);
        assert_eq!(filter.decide(&doc, x), -1);
    }

    #[test]
    fn intersect_limits_membership() {
        let doc = "<doc><a><inner/></a><b/></doc>".parse::<Document>().unwrap();
        let filter = filter_for(
            &doc,
            vec![XPath2Transform::entry(Filter2Op::Intersect, "//a")],
        );

        let a = doc.search(doc.root(), &mut |d, n| d.name(n) == Some("a")).unwrap();
        let inner = doc.search(doc.root(), &mut |d, n| d.name(n) == Some("inner")).unwrap();
        let b = doc.search(doc.root(), &mut |d, n| d.name(n) == Some("b")).unwrap();
        let root = doc.document_element().unwrap();

        assert_eq!(filter.decide(&doc, a), 1);
        assert_eq!(filter.decide(&doc, inner), 1);
        assert_eq!(filter.decide(&doc, b), 0);
        assert_eq!(filter.decide(&doc, root), 0);
    }

    #[test]
    fn union_overrides_missing_intersect() {
        let doc = "<doc><a/><b/></doc>".parse::<Document>().unwrap();
        let filter = filter_for(
            &doc,
            vec![
                XPath2Transform::entry(Filter2Op::Intersect, "//a"),
                XPath2Transform::entry(Filter2Op::Union, "//b"),
            ],
        );

        let a = doc.search(doc.root(), &mut |d, n| d.name(n) == Some("a")).unwrap();
        let b = doc.search(doc.root(), &mut |d, n| d.name(n) == Some("b")).unwrap();

        assert_eq!(filter.decide(&doc, a), 1);
        assert_eq!(filter.decide(&doc, b), 1);
    }

    #[test]
    fn subtract_beats_union() {
        let doc = "<doc><a/></doc>".parse::<Document>().unwrap();
        let filter = filter_for(
            &doc,
            vec![
                XPath2Transform::entry(Filter2Op::Union, "//a"),
                XPath2Transform::entry(Filter2Op::Subtract, "//a"),
            ],
        );

        let a = doc.search(doc.root(), &mut |d, n| d.name(n) == Some("a")).unwrap();

        assert_eq!(filter.decide(&doc, a), -1);
    }
}
