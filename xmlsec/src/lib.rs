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

mod algorithms;
mod context;
mod data;
mod dereference;
mod error;
mod keys;
mod nodeset;

pub mod encryption;
pub mod signature;
pub mod transform;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate lazy_static;

pub use algorithms::*;
pub use context::*;
pub use data::*;
pub use dereference::*;
pub use error::*;
pub use keys::*;
pub use nodeset::*;
pub use transform::{Canonicalizer, Transform, TransformChain, TransformContext};

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::from_utf8;

    use base64::decode;
    use xmldom::Document;

    use crate::encryption::{
        marshal_encrypted_data, CipherData, CipherMode, CipherReference, DocumentSerializer,
        EncryptedData, EncryptionMethod, XmlCipher, NODE_CIPHER_VALUE, NODE_ENCRYPTED_DATA,
    };
    use crate::signature::{KeyInfo, KeyInfoEntry};
    use crate::transform::{Base64Transform, Filter2Op, XPath2Transform, XPathTransform};

    fn aes128_key() -> Vec<u8> {
        (0x10..0x20).collect()
    }

    fn canonical_form(doc: &Document, element: xmldom::NodeId) -> Vec<u8> {
        DocumentSerializer::new(TRANSFORM_C14N_1_0_WITH_COMMENTS)
            .unwrap()
            .serialize_element(doc, element)
            .unwrap()
    }

    #[test]
    fn aes128_element_round_trip() {
        let mut doc = "<a><b>hi</b></a>".parse::<Document>().unwrap();
        let ctx = Context::new();

        let a = doc.document_element().unwrap();
        let b = doc.first_child_element(a).unwrap();
        let original = canonical_form(&doc, b);

        let mut cipher = XmlCipher::new(Some(CIPHER_AES128)).unwrap();
        cipher
            .init(CipherMode::Encrypt, Some(Key::symmetric(aes128_key())))
            .unwrap();

        let ed_element = cipher.do_final(&mut doc, b, false, &ctx).unwrap();

        // <a> now holds the EncryptedData element
        assert_eq!(doc.first_child_element(a), Some(ed_element));
        assert!(doc.is_element_named(ed_element, NODE_ENCRYPTED_DATA, NS_XMLENC));

        // wire format: Base64(IV || ciphertext), IV is one AES block
        let value_node = doc
            .search(doc.root(), &mut |d, n| {
                d.name(n) == Some(NODE_CIPHER_VALUE)
            })
            .unwrap();
        let raw = decode(&doc.content(value_node)).unwrap();
        assert!(raw.len() >= 32);
        assert_eq!(raw.len() % 16, 0);

        let mut decrypter = XmlCipher::new(None).unwrap();
        decrypter
            .init(CipherMode::Decrypt, Some(Key::symmetric(aes128_key())))
            .unwrap();
        decrypter.do_final(&mut doc, ed_element, false, &ctx).unwrap();

        let b = doc.first_child_element(a).unwrap();
        assert_eq!(canonical_form(&doc, b), original);
        assert_eq!(from_utf8(&original).unwrap(), "<b>hi</b>");
    }

    #[test]
    fn aes128_content_round_trip() {
        let mut doc = "<a><b>hi</b><c/></a>".parse::<Document>().unwrap();
        let ctx = Context::new();

        let a = doc.document_element().unwrap();

        let mut cipher = XmlCipher::new(Some(CIPHER_AES128)).unwrap();
        cipher
            .init(CipherMode::Encrypt, Some(Key::symmetric(aes128_key())))
            .unwrap();

        let ed_element = cipher.do_final(&mut doc, a, true, &ctx).unwrap();
        assert_eq!(doc.children(a), &[ed_element]);

        let mut decrypter = XmlCipher::new(None).unwrap();
        decrypter
            .init(CipherMode::Decrypt, Some(Key::symmetric(aes128_key())))
            .unwrap();
        decrypter.do_final(&mut doc, ed_element, false, &ctx).unwrap();

        let names: Vec<_> = doc
            .children(a)
            .iter()
            .filter_map(|n| doc.name(*n))
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn aes128_element_wrapped_by_aes192_key_wrap() {
        let mut doc = "<a><b>secret payload</b></a>".parse::<Document>().unwrap();
        let ctx = Context::new();
        let kek = b"abcdefghijklmnopqrstuvwx";

        let a = doc.document_element().unwrap();
        let b = doc.first_child_element(a).unwrap();
        let original = canonical_form(&doc, b);

        // wrap the fresh data key with the KEK
        let data_key = aes128_key();

        let mut wrapper = XmlCipher::new(Some(KEYWRAP_AES192)).unwrap();
        wrapper
            .init(CipherMode::Wrap, Some(Key::symmetric(&kek[..])))
            .unwrap();
        wrapper
            .encrypt_key(&Key::symmetric(data_key.clone()))
            .unwrap();
        let encrypted_key = wrapper.take_encrypted_key().unwrap();

        // encrypt the element, embedding the EncryptedKey in KeyInfo
        let mut cipher = XmlCipher::new(Some(CIPHER_AES128)).unwrap();
        cipher
            .init(CipherMode::Encrypt, Some(Key::symmetric(data_key)))
            .unwrap();

        let mut key_info = KeyInfo::new();
        key_info
            .entries
            .push(KeyInfoEntry::EncryptedKey(encrypted_key));
        cipher.encrypted_data_mut().unwrap().base.key_info = Some(key_info);

        let ed_element = cipher.do_final(&mut doc, b, false, &ctx).unwrap();

        // decrypt on a fresh cipher carrying only the KEK
        let mut decrypter = XmlCipher::new(None).unwrap();
        decrypter.init(CipherMode::Decrypt, None).unwrap();
        decrypter.set_kek(Key::symmetric(&kek[..]));

        decrypter.do_final(&mut doc, ed_element, false, &ctx).unwrap();

        let b = doc.first_child_element(a).unwrap();
        assert_eq!(canonical_form(&doc, b), original);
    }

    #[test]
    fn same_document_cipher_reference() {
        let key = b"abcdefghijklmnop";
        let secret = b"A test encrypted secret";
        let ctx = Context::new();

        // produce Base64(IV || ciphertext) for the carrier element
        let mut encrypter = XmlCipher::new(Some(CIPHER_AES128)).unwrap();
        encrypter
            .init(CipherMode::Encrypt, Some(Key::symmetric(&key[..])))
            .unwrap();
        let cipher_value = encrypter
            .encrypt_data(secret)
            .unwrap()
            .base
            .cipher_data
            .value()
            .unwrap()
            .to_owned();

        let mut doc = format!(
            "<doc><CipherText Id=\"CipherTextId\">{}</CipherText></doc>",
            cipher_value
        )
        .parse::<Document>()
        .unwrap();

        // EncryptedData referencing the carrier through XPath + Base64
        let mut reference = CipherReference::new("#CipherTextId");
        reference.transforms.push(Box::new(XPathTransform::new(
            "self::text()[parent::CipherText[@Id=\"CipherTextId\"]]",
        )));
        reference.transforms.push(Box::new(Base64Transform));

        let mut encrypted = EncryptedData::new(CipherData::with_reference(reference));
        encrypted.base.encryption_method = Some(EncryptionMethod::new(CIPHER_AES128));

        let root = doc.document_element().unwrap();
        let ed_element = marshal_encrypted_data(&mut doc, &encrypted).unwrap();
        doc.append_child(root, ed_element).unwrap();

        let mut decrypter = XmlCipher::new(None).unwrap();
        decrypter
            .init(CipherMode::Decrypt, Some(Key::symmetric(&key[..])))
            .unwrap();

        let plain = decrypter
            .decrypt_to_byte_array(&doc, ed_element, &ctx)
            .unwrap();
        assert_eq!(plain, secret);
    }

    #[test]
    fn xpath2_subtract_drops_subtree_from_canonicalization() {
        let doc = "<doc><a/><b><x/></b></doc>".parse::<Document>().unwrap();
        let ctx = Context::new();

        let mut chain = TransformChain::new();
        chain.push(Box::new(XPath2Transform::new(vec![
            XPath2Transform::entry(Filter2Op::Subtract, "//b"),
        ])));

        let data = Data::node_set(document_set(&doc, false));
        let transform_ctx = TransformContext::from_context(&ctx);

        let mut sink = VecSink::new();
        chain.execute(&doc, data, &transform_ctx, &mut sink).unwrap();

        let octets = sink.into_bytes();
        assert_eq!(from_utf8(&octets).unwrap(), "<doc><a></a></doc>");
    }

    #[test]
    fn decryption_preserves_inherited_prefix_bindings() {
        let mut doc = "<root xmlns:p=\"urn:p\"><p:item>v</p:item></root>"
            .parse::<Document>()
            .unwrap();
        let ctx = Context::new();

        let root = doc.document_element().unwrap();
        let item = doc.first_child_element(root).unwrap();

        let mut cipher = XmlCipher::new(Some(CIPHER_AES256)).unwrap();
        cipher
            .init(CipherMode::Encrypt, Some(Key::symmetric(vec![7u8; 32])))
            .unwrap();
        let ed_element = cipher.do_final(&mut doc, item, false, &ctx).unwrap();

        let mut decrypter = XmlCipher::new(None).unwrap();
        decrypter
            .init(CipherMode::Decrypt, Some(Key::symmetric(vec![7u8; 32])))
            .unwrap();
        decrypter.do_final(&mut doc, ed_element, false, &ctx).unwrap();

        let item = doc.first_child_element(root).unwrap();
        assert_eq!(doc.name(item), Some("item"));
        assert_eq!(doc.ns_href(item).as_deref(), Some("urn:p"));
        assert_eq!(doc.content(item), "v");
    }

    #[test]
    fn tripledes_element_round_trip() {
        let mut doc = "<a><b>des payload</b></a>".parse::<Document>().unwrap();
        let ctx = Context::new();
        let key = b"abcdefghijklmnopqrstuvwx";

        let a = doc.document_element().unwrap();
        let b = doc.first_child_element(a).unwrap();
        let original = canonical_form(&doc, b);

        let mut cipher = XmlCipher::new(Some(CIPHER_TRIPLEDES)).unwrap();
        cipher
            .init(CipherMode::Encrypt, Some(Key::symmetric(&key[..])))
            .unwrap();
        let ed_element = cipher.do_final(&mut doc, b, false, &ctx).unwrap();

        // 3DES blocks are 8 octets
        let value_node = doc
            .search(doc.root(), &mut |d, n| {
                d.name(n) == Some(NODE_CIPHER_VALUE)
            })
            .unwrap();
        let raw = decode(&doc.content(value_node)).unwrap();
        assert_eq!(raw.len() % 8, 0);

        let mut decrypter = XmlCipher::new(None).unwrap();
        decrypter
            .init(CipherMode::Decrypt, Some(Key::symmetric(&key[..])))
            .unwrap();
        decrypter.do_final(&mut doc, ed_element, false, &ctx).unwrap();

        let b = doc.first_child_element(a).unwrap();
        assert_eq!(canonical_form(&doc, b), original);
    }
}
