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

use super::{Document, NodeId, NodeKind};

pub const XML_NS_HREF: &str = "http://www.w3.org/XML/1998/namespace";

/// One `xmlns` or `xmlns:*` declaration attached to an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsDecl {
    pub prefix: Option<String>,
    pub href: String,
}

impl Document {
    /// Resolves a namespace prefix by walking the ancestor-or-self chain.
    ///
    /// `None` stands for the default namespace. The `xml` prefix is always
    /// bound.
    pub fn resolve_prefix(&self, node: NodeId, prefix: Option<&str>) -> Option<String> {
        if prefix == Some("xml") {
            return Some(XML_NS_HREF.into());
        }

        let mut current = Some(node);
        while let Some(n) = current {
            if self.kind(n) == NodeKind::Element {
                for decl in self.ns_decls(n) {
                    if decl.prefix.as_deref() == prefix {
                        if decl.href.is_empty() {
                            return None;
                        }

                        return Some(decl.href.clone());
                    }
                }
            }

            current = self.parent(n);
        }

        None
    }

    /// All namespace bindings in scope at `node`, nearest binding wins.
    ///
    /// Undeclared default namespaces (`xmlns=""`) shadow outer defaults and
    /// are not reported.
    pub fn in_scope_namespaces(&self, node: NodeId) -> Vec<NsDecl> {
        let mut ret: Vec<NsDecl> = Vec::new();
        let mut shadowed: Vec<Option<String>> = Vec::new();

        let mut current = Some(node);
        while let Some(n) = current {
            if self.kind(n) == NodeKind::Element {
                for decl in self.ns_decls(n) {
                    if shadowed.contains(&decl.prefix) {
                        continue;
                    }

                    shadowed.push(decl.prefix.clone());

                    if !decl.href.is_empty() {
                        ret.push(decl.clone());
                    }
                }
            }

            current = self.parent(n);
        }

        ret
    }

    /// Namespace of the element itself (resolved from its qualified name).
    pub fn ns_href(&self, node: NodeId) -> Option<String> {
        let name = self.qname(node)?;

        self.resolve_prefix(node, name.prefix.as_deref())
    }
}
