//! Index definitions.
//!
//! An index is declared by name with one or more path expressions:
//!
//! - `field` or `a.b.c`: simple index on one value
//! - `a+b+c`: compound index, keyed by the tuple of the fields
//! - `*field`: multi-entry index, one entry per array element
//!
//! `:url` and `:origin` address envelope fields instead of the record.
//! Every table carries an automatic `:origin` index used to drop a source's
//! rows when it is unindexed.

mod def;

pub use def::{
    FieldPath, FieldValue, IndexDef, IndexShape, PathExpr, ORIGIN_INDEX, URL_INDEX,
};
