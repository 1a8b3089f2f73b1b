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

use std::str::from_utf8;

use base64::decode;
use xmldom::{Document, NodeId};

use crate::{Data, DataTypes, Error, TRANSFORM_BASE64};

use super::{node_set_text, Transform, TransformContext};

/* Base64Transform */

/// Decodes the Base64 text content of the input into an octet stream.
pub struct Base64Transform;

impl Transform for Base64Transform {
    fn algorithm(&self) -> &str {
        TRANSFORM_BASE64
    }

    fn input_types(&self) -> DataTypes {
        DataTypes::Any
    }

    fn terminal_capable(&self) -> bool {
        true
    }

    fn apply(&self, doc: &Document, data: Data, _ctx: &TransformContext) -> Result<Data, Error> {
        let text = match &data {
            Data::Octets(octets) => from_utf8(&octets.bytes)
                .map_err(|err| Error::TransformError(err.to_string()))?
                .to_owned(),
            _ => node_set_text(doc, &data)?,
        };

        let text: String = text.split_whitespace().collect();
        let bytes = decode(&text)?;

        Ok(Data::octets(bytes))
    }
}

pub(crate) fn factory(_doc: &Document, _element: NodeId) -> Result<Box<dyn Transform>, Error> {
    Ok(Box::new(Base64Transform))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_text_content() {
        let doc = "<data>aGVs\n bG8=</data>".parse::<Document>().unwrap();
        let transform = Base64Transform;

        let data = Data::sub_tree(doc.document_element().unwrap(), true);
        let ctx = TransformContext::default();

        match transform.apply(&doc, data, &ctx).unwrap() {
            Data::Octets(octets) => assert_eq!(&octets.bytes[..], b"hello"),
            x => panic!("unexpected data: {:?}", x),
        }
    }

    #[test]
    fn decodes_octet_stream() {
        let doc = "<a/>".parse::<Document>().unwrap();
        let transform = Base64Transform;

        let data = Data::octets(&b"aGVsbG8="[..]);
        let ctx = TransformContext::default();

        match transform.apply(&doc, data, &ctx).unwrap() {
            Data::Octets(octets) => assert_eq!(&octets.bytes[..], b"hello"),
            x => panic!("unexpected data: {:?}", x),
        }
    }
}
