//! Index definitions and key extraction.

use crate::envelope::RecordEnvelope;
use crate::error::{CoreError, CoreResult};
use serde_json::Value;
use sitedb_codec::{encode_key, KeyValue};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Name of the primary-key pseudo index.
pub const URL_INDEX: &str = ":url";

/// Name of the automatic origin index present on every table.
pub const ORIGIN_INDEX: &str = ":origin";

/// Where an index reads a value from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPath {
    /// The envelope url.
    Url,
    /// The envelope origin.
    Origin,
    /// A (possibly dotted) path into the document.
    Record(Vec<String>),
}

impl FieldPath {
    fn parse(expr: &str) -> CoreResult<Self> {
        match expr {
            URL_INDEX => Ok(Self::Url),
            ORIGIN_INDEX => Ok(Self::Origin),
            _ => {
                let parts: Vec<String> = expr.split('.').map(str::to_string).collect();
                if parts.iter().any(String::is_empty) {
                    return Err(CoreError::schema(format!("invalid field path '{expr}'")));
                }
                Ok(Self::Record(parts))
            }
        }
    }

    /// Reads the field from an envelope, `None` when absent.
    #[must_use]
    pub fn resolve<'a>(&self, envelope: &'a RecordEnvelope) -> Option<FieldValue<'a>> {
        match self {
            Self::Url => Some(FieldValue::Str(&envelope.url)),
            Self::Origin => Some(FieldValue::Str(&envelope.origin)),
            Self::Record(parts) => {
                let mut current = &envelope.record;
                for part in parts {
                    current = current.as_object()?.get(part)?;
                }
                Some(FieldValue::Json(current))
            }
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url => f.write_str(URL_INDEX),
            Self::Origin => f.write_str(ORIGIN_INDEX),
            Self::Record(parts) => f.write_str(&parts.join(".")),
        }
    }
}

/// A field value borrowed from an envelope.
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    /// An envelope string field.
    Str(&'a str),
    /// A document value.
    Json(&'a Value),
}

impl FieldValue<'_> {
    fn to_key(self) -> Option<KeyValue> {
        match self {
            Self::Str(s) => Some(KeyValue::from(s)),
            Self::Json(v) => KeyValue::from_json(v).ok(),
        }
    }
}

/// One way of deriving an index key from a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathExpr {
    /// `field`: one entry keyed by the field value.
    Field(FieldPath),
    /// `a+b+...`: one entry keyed by the tuple of field values.
    Compound(Vec<FieldPath>),
    /// `*field`: one entry per array element (or one for a scalar).
    MultiEntry(FieldPath),
}

impl PathExpr {
    /// Parses a path expression.
    ///
    /// # Errors
    ///
    /// Returns a schema error for empty components or `*` combined with `+`.
    pub fn parse(expr: &str) -> CoreResult<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(CoreError::schema("empty index path"));
        }
        if let Some(field) = expr.strip_prefix('*') {
            if field.contains('+') {
                return Err(CoreError::schema(format!(
                    "multi-entry index cannot be compound: '{expr}'"
                )));
            }
            return Ok(Self::MultiEntry(FieldPath::parse(field)?));
        }
        if expr.contains('+') {
            let fields = expr
                .split('+')
                .map(|part| FieldPath::parse(part.trim()))
                .collect::<CoreResult<Vec<_>>>()?;
            return Ok(Self::Compound(fields));
        }
        Ok(Self::Field(FieldPath::parse(expr)?))
    }

    /// Returns the shape of this expression.
    #[must_use]
    pub fn shape(&self) -> IndexShape {
        match self {
            Self::Field(_) => IndexShape::Simple,
            Self::Compound(fields) => IndexShape::Compound(fields.len()),
            Self::MultiEntry(_) => IndexShape::MultiEntry,
        }
    }

    /// Derives index keys, or `None` if a required field is absent.
    fn keys(&self, envelope: &RecordEnvelope) -> Option<Vec<KeyValue>> {
        match self {
            Self::Field(path) => {
                let value = path.resolve(envelope)?;
                Some(value.to_key().into_iter().collect())
            }
            Self::Compound(paths) => {
                let values = paths
                    .iter()
                    .map(|p| p.resolve(envelope))
                    .collect::<Option<Vec<_>>>()?;
                let parts = values.into_iter().map(FieldValue::to_key).collect::<Option<Vec<_>>>();
                Some(parts.map(KeyValue::Array).into_iter().collect())
            }
            Self::MultiEntry(path) => match path.resolve(envelope)? {
                FieldValue::Json(Value::Array(items)) => {
                    Some(items.iter().filter_map(|v| KeyValue::from_json(v).ok()).collect())
                }
                scalar => Some(scalar.to_key().into_iter().collect()),
            },
        }
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(p) => write!(f, "{p}"),
            Self::Compound(ps) => {
                let parts: Vec<String> = ps.iter().map(ToString::to_string).collect();
                f.write_str(&parts.join("+"))
            }
            Self::MultiEntry(p) => write!(f, "*{p}"),
        }
    }
}

/// Arity/shape of an index; every def under one name must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexShape {
    /// Single field.
    Simple,
    /// Tuple of the given width.
    Compound(usize),
    /// One entry per array element.
    MultiEntry,
}

/// A named secondary index.
///
/// Holds one or more alternative path expressions of the same shape. When
/// building entries for a record, the first expression whose fields are all
/// present wins, so documents that name the same attribute differently can
/// share one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    name: String,
    defs: Vec<PathExpr>,
}

impl IndexDef {
    /// Creates an index from a name and path expressions.
    ///
    /// # Errors
    ///
    /// Returns a schema error for an empty name, no expressions, a parse
    /// failure, or expressions of mismatched shape.
    pub fn new<I, S>(name: impl Into<String>, defs: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::schema("index name cannot be empty"));
        }
        let defs = defs
            .into_iter()
            .map(|d| PathExpr::parse(d.as_ref()))
            .collect::<CoreResult<Vec<_>>>()?;
        let Some(first) = defs.first() else {
            return Err(CoreError::schema(format!(
                "index '{name}' has no definitions"
            )));
        };
        let shape = first.shape();
        if let Some(other) = defs.iter().find(|d| d.shape() != shape) {
            return Err(CoreError::schema(format!(
                "index '{name}' mixes shapes: '{first}' is {shape:?}, '{other}' is {:?}",
                other.shape()
            )));
        }
        Ok(Self { name, defs })
    }

    /// Creates an index named after its single expression. A multi-entry
    /// expression `*tags` is named `tags`.
    ///
    /// # Errors
    ///
    /// Returns a schema error if the expression does not parse.
    pub fn simple(expr: &str) -> CoreResult<Self> {
        Self::new(expr.trim_start_matches('*'), [expr])
    }

    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path expressions in priority order.
    #[must_use]
    pub fn defs(&self) -> &[PathExpr] {
        &self.defs
    }

    /// Shared shape of every expression.
    #[must_use]
    pub fn shape(&self) -> IndexShape {
        self.defs
            .first()
            .map_or(IndexShape::Simple, PathExpr::shape)
    }

    /// Returns true for multi-entry indexes.
    #[must_use]
    pub fn is_multi_entry(&self) -> bool {
        self.shape() == IndexShape::MultiEntry
    }

    /// Encoded index keys for a record, deduplicated and sorted.
    ///
    /// Values that have no key form (objects) are skipped.
    #[must_use]
    pub fn encoded_keys(&self, envelope: &RecordEnvelope) -> Vec<Vec<u8>> {
        let Some(keys) = self.defs.iter().find_map(|d| d.keys(envelope)) else {
            return Vec::new();
        };
        let mut encoded = BTreeSet::new();
        for key in &keys {
            match encode_key(key) {
                Ok(bytes) => {
                    encoded.insert(bytes);
                }
                Err(err) => {
                    debug!(index = %self.name, url = %envelope.url, %err, "value not indexable");
                }
            }
        }
        encoded.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sitedb_codec::decode_key;

    fn env(record: Value) -> RecordEnvelope {
        RecordEnvelope::new("dweb://a/r.json", "dweb://a", record)
    }

    fn decoded(def: &IndexDef, record: Value) -> Vec<KeyValue> {
        def.encoded_keys(&env(record))
            .iter()
            .map(|k| decode_key(k).unwrap())
            .collect()
    }

    #[test]
    fn parse_expressions() {
        assert_eq!(
            PathExpr::parse("name").unwrap(),
            PathExpr::Field(FieldPath::Record(vec!["name".into()]))
        );
        assert_eq!(PathExpr::parse("a+b").unwrap().shape(), IndexShape::Compound(2));
        assert_eq!(PathExpr::parse("*tags").unwrap().shape(), IndexShape::MultiEntry);
        assert_eq!(
            PathExpr::parse(":origin").unwrap(),
            PathExpr::Field(FieldPath::Origin)
        );
        assert!(PathExpr::parse("*a+b").is_err());
        assert!(PathExpr::parse("a+").is_err());
        assert!(PathExpr::parse("").is_err());
    }

    #[test]
    fn mismatched_shapes_rejected() {
        assert!(IndexDef::new("x", ["a", "b+c"]).is_err());
        assert!(IndexDef::new("x", ["a+b", "c+d+e"]).is_err());
        assert!(IndexDef::new("x", ["*a", "b"]).is_err());
        assert!(IndexDef::new("x", Vec::<&str>::new()).is_err());
        assert!(IndexDef::new("x", ["a+b", "c+d"]).is_ok());
    }

    #[test]
    fn simple_and_dotted_paths() {
        let def = IndexDef::simple("author.name").unwrap();
        assert_eq!(
            decoded(&def, json!({"author": {"name": "bob"}})),
            vec![KeyValue::from("bob")]
        );
        assert!(decoded(&def, json!({"author": "bob"})).is_empty());
    }

    #[test]
    fn compound_requires_every_field() {
        let def = IndexDef::simple("type+createdAt").unwrap();
        assert_eq!(
            decoded(&def, json!({"type": "comment", "createdAt": 100})),
            vec![KeyValue::from(vec![KeyValue::from("comment"), KeyValue::from(100)])]
        );
        assert!(decoded(&def, json!({"type": "comment"})).is_empty());
    }

    #[test]
    fn first_present_definition_wins() {
        let def = IndexDef::new("city", ["city", "colour", "borough"]).unwrap();
        assert_eq!(
            decoded(&def, json!({"colour": "minnesota", "borough": "x"})),
            vec![KeyValue::from("minnesota")]
        );
        assert_eq!(
            decoded(&def, json!({"city": "dallas", "colour": "minnesota"})),
            vec![KeyValue::from("dallas")]
        );
        assert!(decoded(&def, json!({"other": 1})).is_empty());
    }

    #[test]
    fn multi_entry_fans_out_and_dedupes() {
        let def = IndexDef::simple("*fruits").unwrap();
        assert_eq!(
            decoded(&def, json!({"fruits": ["banana", "apple", "banana"]})),
            vec![KeyValue::from("apple"), KeyValue::from("banana")]
        );
        assert_eq!(
            decoded(&def, json!({"fruits": "cherry"})),
            vec![KeyValue::from("cherry")]
        );
        assert!(decoded(&def, json!({"fruits": []})).is_empty());
    }

    #[test]
    fn envelope_fields() {
        let def = IndexDef::simple(":origin").unwrap();
        assert_eq!(decoded(&def, json!({})), vec![KeyValue::from("dweb://a")]);
    }

    #[test]
    fn objects_are_not_indexed() {
        let def = IndexDef::simple("meta").unwrap();
        assert!(decoded(&def, json!({"meta": {"a": 1}})).is_empty());
    }
}
