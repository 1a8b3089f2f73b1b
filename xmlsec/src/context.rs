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

use bytes::Bytes;

use crate::dereference::UriDereferencer;
use crate::signature::KeySelector;

/// Per-operation configuration shared by signing, validation and
/// decryption.
#[derive(Default)]
pub struct Context {
    /// Base URI used to resolve relative reference URIs.
    pub base_uri: Option<String>,

    /// Retain dereferenced data and the digest input stream on references.
    pub cache_reference: bool,

    /// Materialize the implicit C14N 1.1 transform during sign.
    pub use_c14n11: bool,

    /// Enforce the transform count cap, the algorithm deny list and ID
    /// pre-registration.
    pub secure_validation: bool,

    /// Payload for detached references (`URI` absent).
    pub payload: Option<Bytes>,

    /// Overrides the default URI dereferencer.
    pub dereferencer: Option<Box<dyn UriDereferencer>>,

    /// Selects verification and decryption keys from `KeyInfo`.
    pub key_selector: Option<Box<dyn KeySelector>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }
}
