//! # SiteDB Codec
//!
//! Order-preserving key encoding for SiteDB indexes.
//!
//! Byte-wise comparison of encoded keys matches the semantic order of the
//! values they encode:
//!
//! - Numbers ascend by magnitude (negative before positive)
//! - Strings ascend by code point
//! - Arrays compare element by element, shorter first on a shared prefix
//! - Across types: `null < false < true < number < text < array`
//!
//! Compound index keys are arrays, so a partial tuple like `["Rice"]` sorts
//! immediately before every tuple it prefixes.
//!
//! The crate also carries the CBOR helpers used to store record envelopes.
//!
//! ## Usage
//!
//! ```
//! use sitedb_codec::{decode_key, encode_key, KeyValue};
//!
//! let a = encode_key(&KeyValue::from("apple")).unwrap();
//! let b = encode_key(&KeyValue::from("banana")).unwrap();
//! assert!(a < b);
//! assert_eq!(decode_key(&a).unwrap(), KeyValue::from("apple"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod key;
mod value;

pub use cbor::{from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use key::{
    ceiling_of, decode_key, decode_key_prefix, encode_key, encode_text, text_prefix, KEY_CEILING,
};
pub use value::KeyValue;
