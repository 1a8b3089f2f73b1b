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

use xmldom::{Document, NodeId, NodeKind, NodeVisibility};

use crate::{Data, Error};

/// Node membership decision used by canonicalization, modelled after the
/// XPath Filter 2.0 contract:
///
/// * `-1`: drop the node and its whole subtree,
/// * `0`: drop this node but keep descending into its children,
/// * `1`: keep the node.
pub trait NodeFilter {
    fn is_node_include(&self, doc: &Document, node: NodeId, level: usize) -> i8;
}

/// Materializes the subtree rooted at `root` as a node set.
pub fn sub_tree_set(doc: &Document, root: NodeId, exclude_comments: bool) -> HashSet<NodeId> {
    doc.descendants(root)
        .into_iter()
        .filter(|n| !exclude_comments || doc.kind(*n) != NodeKind::Comment)
        .collect()
}

/// The whole document as a node set, optionally without comments.
pub fn document_set(doc: &Document, with_comments: bool) -> HashSet<NodeId> {
    sub_tree_set(doc, doc.root(), !with_comments)
}

/// Bridges a [`Data`] value (and optional extra filters) to the boolean
/// visibility callback consumed by the canonicalizer.
pub struct DataVisibility<'a> {
    nodes: Option<&'a HashSet<NodeId>>,
    sub_tree: Option<(NodeId, bool)>,
    filters: &'a [&'a dyn NodeFilter],
}

impl<'a> DataVisibility<'a> {
    pub fn new(data: &'a Data) -> Result<Self, Error> {
        match data {
            Data::NodeSet(set) => Ok(Self {
                nodes: Some(&set.nodes),
                sub_tree: None,
                filters: &[],
            }),
            Data::SubTree(tree) => Ok(Self {
                nodes: None,
                sub_tree: Some((tree.root, tree.exclude_comments)),
                filters: &[],
            }),
            Data::Octets(_) => Err(Error::UnexpectedDataType(data.into())),
        }
    }

    pub fn with_filters(mut self, filters: &'a [&'a dyn NodeFilter]) -> Self {
        self.filters = filters;

        self
    }
}

impl NodeVisibility for DataVisibility<'_> {
    fn is_visible(&self, doc: &Document, node: NodeId) -> bool {
        if let Some(nodes) = self.nodes {
            if !nodes.contains(&node) {
                return false;
            }
        }

        if let Some((root, exclude_comments)) = self.sub_tree {
            if !doc.is_ancestor_or_self(root, node) {
                return false;
            }

            if exclude_comments && doc.kind(node) == NodeKind::Comment {
                return false;
            }
        }

        for filter in self.filters {
            if !filter_allows(*filter, doc, node) {
                return false;
            }
        }

        true
    }
}

/// Collapses the three-valued filter result into plain visibility: a node
/// is dropped if the filter rejects it, or prunes any of its ancestors.
pub fn filter_allows(filter: &dyn NodeFilter, doc: &Document, node: NodeId) -> bool {
    let level = node_level(doc, node);
    if filter.is_node_include(doc, node, level) != 1 {
        return false;
    }

    let mut level = level;
    let mut current = doc.parent(node);
    while let Some(n) = current {
        level = level.saturating_sub(1);

        if filter.is_node_include(doc, n, level) == -1 {
            return false;
        }

        current = doc.parent(n);
    }

    true
}

fn node_level(doc: &Document, node: NodeId) -> usize {
    let mut level = 0;
    let mut current = doc.parent(node);
    while let Some(n) = current {
        level += 1;
        current = doc.parent(n);
    }

    level
}
