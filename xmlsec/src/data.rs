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

#![allow(non_upper_case_globals)]

use std::borrow::Borrow;
use std::collections::HashSet;

use bytes::Bytes;
use openssl::hash::{Hasher, MessageDigest};
use xmldom::NodeId;

use crate::Error;

/// Input and output of a transform.
#[derive(Debug, Clone)]
pub enum Data {
    NodeSet(NodeSetData),
    SubTree(SubTreeData),
    Octets(OctetStreamData),
}

#[derive(Debug, Clone)]
pub struct NodeSetData {
    pub nodes: HashSet<NodeId>,
}

#[derive(Debug, Clone)]
pub struct SubTreeData {
    pub root: NodeId,
    pub exclude_comments: bool,
}

#[derive(Debug, Clone)]
pub struct OctetStreamData {
    pub bytes: Bytes,
    pub source_uri: Option<String>,
    pub mime_type: Option<String>,
}

impl Data {
    pub fn node_set(nodes: HashSet<NodeId>) -> Self {
        Self::NodeSet(NodeSetData { nodes })
    }

    pub fn sub_tree(root: NodeId, exclude_comments: bool) -> Self {
        Self::SubTree(SubTreeData {
            root,
            exclude_comments,
        })
    }

    pub fn octets<T: Into<Bytes>>(bytes: T) -> Self {
        Self::Octets(OctetStreamData {
            bytes: bytes.into(),
            source_uri: None,
            mime_type: None,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataType {
    NodeSet,
    SubTree,
    Octets,
}

bitflags! {
    pub struct DataTypes: u32 {
        const NodeSet = 0b00000001;
        const SubTree = 0b00000010;
        const Octets = 0b00000100;

        const None = 0;
        const Nodes = Self::NodeSet.bits | Self::SubTree.bits;
        const Any = Self::NodeSet.bits | Self::SubTree.bits | Self::Octets.bits;
    }
}

impl DataTypes {
    pub fn has(&self, data_type: &DataType) -> bool {
        match data_type {
            DataType::NodeSet => self.contains(DataTypes::NodeSet),
            DataType::SubTree => self.contains(DataTypes::SubTree),
            DataType::Octets => self.contains(DataTypes::Octets),
        }
    }
}

impl<T> From<T> for DataType
where
    T: Borrow<Data>,
{
    fn from(data: T) -> DataType {
        match data.borrow() {
            Data::NodeSet(_) => DataType::NodeSet,
            Data::SubTree(_) => DataType::SubTree,
            Data::Octets(_) => DataType::Octets,
        }
    }
}

/* Octet sinks */

/// Receiver of the octets produced by the terminal transform of a chain.
pub trait OctetSink {
    fn write_octets(&mut self, buf: &[u8]) -> Result<(), Error>;
}

/// Feeds a message digest.
pub struct DigestSink {
    hasher: Hasher,
}

impl DigestSink {
    pub fn new(digest: MessageDigest) -> Result<Self, Error> {
        let hasher = Hasher::new(digest).map_err(|err| Error::DigestError(err.to_string()))?;

        Ok(Self { hasher })
    }

    pub fn finish(mut self) -> Result<Vec<u8>, Error> {
        let bytes = self
            .hasher
            .finish()
            .map_err(|err| Error::DigestError(err.to_string()))?;

        Ok(bytes.to_vec())
    }
}

impl OctetSink for DigestSink {
    fn write_octets(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.hasher
            .update(buf)
            .map_err(|err| Error::DigestError(err.to_string()))
    }
}

/// Collects the octets into a buffer.
#[derive(Default)]
pub struct VecSink {
    data: Vec<u8>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl OctetSink for VecSink {
    fn write_octets(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.data.extend_from_slice(buf);

        Ok(())
    }
}

/// Copies the octet stream while forwarding it to the inner sink. Used to
/// retain the digest input when reference caching is enabled.
pub struct TeeSink<'a> {
    inner: &'a mut dyn OctetSink,
    copy: Vec<u8>,
}

impl<'a> TeeSink<'a> {
    pub fn new(inner: &'a mut dyn OctetSink) -> Self {
        Self {
            inner,
            copy: Vec::new(),
        }
    }

    pub fn into_copy(self) -> Vec<u8> {
        self.copy
    }
}

impl OctetSink for TeeSink<'_> {
    fn write_octets(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.copy.extend_from_slice(buf);

        self.inner.write_octets(buf)
    }
}
