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

use std::io::Error as IoError;
use std::str::Utf8Error;

use quick_xml::events::attributes::AttrError;
use quick_xml::Error as QuickXmlError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO Error: {0}")]
    IoError(IoError),

    #[error("Parse Error: {0}")]
    ParseError(String),

    #[error("Invalid UTF-8: {0}")]
    Utf8Error(Utf8Error),

    #[error("Node is not an element!")]
    NotAnElement,

    #[error("Node is not detached!")]
    NodeNotDetached,

    #[error("Node is not attached to a parent!")]
    NodeNotAttached,

    #[error("Document has no root element!")]
    NoRootElement,

    #[error("XPath Syntax Error: {0}")]
    XPathSyntax(String),

    #[error("XPath Evaluation Error: {0}")]
    XPathEval(String),

    #[error("Canonicalization failed: {0}")]
    C14nFailed(String),
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Self::IoError(err)
    }
}

impl From<Utf8Error> for Error {
    fn from(err: Utf8Error) -> Self {
        Self::Utf8Error(err)
    }
}

impl From<QuickXmlError> for Error {
    fn from(err: QuickXmlError) -> Self {
        Self::ParseError(err.to_string())
    }
}

impl From<AttrError> for Error {
    fn from(err: AttrError) -> Self {
        Self::ParseError(err.to_string())
    }
}
