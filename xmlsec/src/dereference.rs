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

use url::{ParseError, Url};
use xmldom::{Document, Here, NodeId};

use crate::{document_set, Context, Data, Error};

/// Reference descriptor handed to a dereferencer.
pub struct DereferenceRequest<'a> {
    pub uri: Option<&'a str>,
    pub base_uri: Option<&'a str>,
    /// The attribute node carrying the URI, exposed as `here()` during
    /// transform evaluation.
    pub here: Option<Here>,
}

/// Resolves a reference URI to a [`Data`] value.
pub trait UriDereferencer {
    fn dereference(
        &self,
        doc: &Document,
        request: &DereferenceRequest,
        ctx: &Context,
    ) -> Result<Data, Error>;
}

/// Default behavior: detached payloads and same-document references. Any
/// other URI requires a caller supplied dereferencer, remote retrieval is
/// not part of the engine.
pub struct DefaultDereferencer;

impl UriDereferencer for DefaultDereferencer {
    fn dereference(
        &self,
        doc: &Document,
        request: &DereferenceRequest,
        ctx: &Context,
    ) -> Result<Data, Error> {
        let uri = match request.uri {
            None => {
                let payload = ctx.payload.clone().ok_or_else(|| {
                    Error::DereferenceError(
                        "reference without URI requires a context payload".into(),
                    )
                })?;

                return Ok(Data::octets(payload));
            }
            Some(uri) => uri,
        };

        if uri.is_empty() {
            // same-document reference to the whole document, comments are
            // excluded for the bare form
            return Ok(Data::node_set(document_set(doc, false)));
        }

        if let Some(fragment) = uri.strip_prefix('#') {
            return same_document(doc, fragment, ctx);
        }

        let resolved = resolve_uri(uri, request.base_uri)?;

        Err(Error::DereferenceError(format!(
            "external URI '{}' requires a caller supplied dereferencer",
            resolved
        )))
    }
}

fn same_document(doc: &Document, fragment: &str, ctx: &Context) -> Result<Data, Error> {
    if fragment == "xpointer(/)" {
        return Ok(Data::node_set(document_set(doc, true)));
    }

    let (id, with_comments) = match parse_xpointer_id(fragment) {
        Some(id) => (id, true),
        None => (fragment, false),
    };

    let node = lookup_id(doc, id, ctx)?;

    Ok(Data::sub_tree(node, !with_comments))
}

fn parse_xpointer_id(fragment: &str) -> Option<&str> {
    let inner = fragment.strip_prefix("xpointer(id(")?;
    let inner = inner.strip_suffix("))")?;

    inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
}

fn lookup_id(doc: &Document, id: &str, ctx: &Context) -> Result<NodeId, Error> {
    if let Some(node) = doc.element_by_id(id) {
        return Ok(node);
    }

    if ctx.secure_validation {
        // only pre-registered IDs resolve under secure validation
        return Err(Error::DereferenceError(format!(
            "ID '{}' is not registered",
            id
        )));
    }

    doc.find_by_id_attr(id)
        .ok_or_else(|| Error::DereferenceError(format!("no element with ID '{}'", id)))
}

/// Dereferences through the context override, falling back to the default
/// resolver.
pub(crate) fn dereference(
    doc: &Document,
    request: &DereferenceRequest,
    ctx: &Context,
) -> Result<Data, Error> {
    match &ctx.dereferencer {
        Some(custom) => custom.dereference(doc, request, ctx),
        None => DefaultDereferencer.dereference(doc, request, ctx),
    }
}

/// Checks URI syntax; relative references are resolved against the base
/// URI when one is present.
pub fn resolve_uri(uri: &str, base_uri: Option<&str>) -> Result<String, Error> {
    match Url::parse(uri) {
        Ok(url) => Ok(String::from(url)),
        Err(ParseError::RelativeUrlWithoutBase) => match base_uri {
            Some(base) => {
                let base = Url::parse(base)
                    .map_err(|err| Error::InvalidInput(format!("invalid base URI: {}", err)))?;
                let url = base
                    .join(uri)
                    .map_err(|err| Error::InvalidInput(format!("invalid URI '{}': {}", uri, err)))?;

                Ok(String::from(url))
            }
            None => {
                validate_uri_reference(uri)?;

                Ok(uri.to_owned())
            }
        },
        Err(err) => Err(Error::InvalidInput(format!(
            "invalid URI '{}': {}",
            uri, err
        ))),
    }
}

/// Syntax check for URIs stored in attributes (`URI`, `Type`, `Encoding`).
pub fn validate_uri_reference(uri: &str) -> Result<(), Error> {
    if uri.is_empty() || uri.starts_with('#') {
        return Ok(());
    }

    if uri.chars().any(|c| c == ' ' || c == '<' || c == '>' || c == '"') {
        return Err(Error::InvalidInput(format!("invalid URI '{}'", uri)));
    }

    match Url::parse(uri) {
        Ok(_) | Err(ParseError::RelativeUrlWithoutBase) => Ok(()),
        Err(err) => Err(Error::InvalidInput(format!(
            "invalid URI '{}': {}",
            uri, err
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_uri_selects_document_without_comments() {
        let doc = "<a><!--c--><b/></a>".parse::<Document>().unwrap();
        let ctx = Context::new();
        let request = DereferenceRequest {
            uri: Some(""),
            base_uri: None,
            here: None,
        };

        match dereference(&doc, &request, &ctx).unwrap() {
            Data::NodeSet(set) => {
                let comment = doc
                    .search(doc.root(), &mut |d, n| {
                        d.kind(n) == xmldom::NodeKind::Comment
                    })
                    .unwrap();

                assert!(!set.nodes.contains(&comment));
                assert!(set.nodes.len() > 1);
            }
            x => panic!("unexpected data: {:?}", x),
        }
    }

    #[test]
    fn fragment_resolves_id_attribute() {
        let doc = "<a><b Id=\"x\"><c/></b></a>".parse::<Document>().unwrap();
        let ctx = Context::new();
        let request = DereferenceRequest {
            uri: Some("#x"),
            base_uri: None,
            here: None,
        };

        match dereference(&doc, &request, &ctx).unwrap() {
            Data::SubTree(tree) => {
                assert_eq!(doc.name(tree.root), Some("b"));
                assert!(tree.exclude_comments);
            }
            x => panic!("unexpected data: {:?}", x),
        }
    }

    #[test]
    fn secure_validation_requires_registered_ids() {
        let mut doc = "<a><b Id=\"x\"/></a>".parse::<Document>().unwrap();
        let ctx = Context {
            secure_validation: true,
            ..Context::new()
        };
        let request = DereferenceRequest {
            uri: Some("#x"),
            base_uri: None,
            here: None,
        };

        assert!(dereference(&doc, &request, &ctx).is_err());

        let b = doc.find_by_id_attr("x").unwrap();
        doc.register_id("x", b);

        assert!(dereference(&doc, &request, &ctx).is_ok());
    }

    #[test]
    fn external_uri_needs_custom_resolver() {
        let doc = "<a/>".parse::<Document>().unwrap();
        let ctx = Context::new();
        let request = DereferenceRequest {
            uri: Some("http://example.com/data.xml"),
            base_uri: None,
            here: None,
        };

        match dereference(&doc, &request, &ctx) {
            Err(Error::DereferenceError(_)) => (),
            x => panic!("unexpected result: {:?}", x),
        }
    }

    #[test]
    fn uri_validation() {
        assert!(validate_uri_reference("").is_ok());
        assert!(validate_uri_reference("#frag").is_ok());
        assert!(validate_uri_reference("http://example.com/x").is_ok());
        assert!(validate_uri_reference("relative/path").is_ok());
        assert!(validate_uri_reference("not a uri").is_err());
    }
}
