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

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::ptr::write_volatile;
use std::sync::atomic::{compiler_fence, Ordering};

use openssl::pkey::{PKey, Private, Public};

use crate::Error;

/// Raw symmetric key material. The buffer is wiped on drop.
pub struct SymmetricKey {
    bytes: Vec<u8>,
}

impl SymmetricKey {
    pub fn new<T: Into<Vec<u8>>>(bytes: T) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Clone for SymmetricKey {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
        }
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        for byte in &mut self.bytes {
            unsafe {
                write_volatile(byte, 0);
            }
        }

        compiler_fence(Ordering::SeqCst);
    }
}

impl Debug for SymmetricKey {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "SymmetricKey({} bytes)", self.bytes.len())
    }
}

/// Key material accepted by the signature and encryption engines.
#[derive(Debug)]
pub enum Key {
    Symmetric(SymmetricKey),
    RsaPublic(PKey<Public>),
    RsaPrivate(PKey<Private>),
}

impl Key {
    pub fn symmetric<T: Into<Vec<u8>>>(bytes: T) -> Self {
        Self::Symmetric(SymmetricKey::new(bytes))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Symmetric(_) => "symmetric",
            Self::RsaPublic(_) => "RSA public",
            Self::RsaPrivate(_) => "RSA private",
        }
    }

    pub fn as_symmetric(&self) -> Result<&SymmetricKey, Error> {
        match self {
            Self::Symmetric(key) => Ok(key),
            x => Err(Error::InvalidInput(format!(
                "expected a symmetric key, got a {} key",
                x.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_key_debug_is_redacted() {
        let key = SymmetricKey::new(vec![0x10; 16]);

        assert_eq!(format!("{:?}", key), "SymmetricKey(16 bytes)");
    }

    #[test]
    fn as_symmetric_rejects_asymmetric_keys() {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let key = Key::RsaPrivate(PKey::from_rsa(rsa).unwrap());

        assert!(key.as_symmetric().is_err());
    }
}
