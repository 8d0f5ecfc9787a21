//! Canonical tagged-field binary encoding.
//!
//! Every wire type encodes as a CBOR map keyed by small ascending integer
//! tags rather than field names, via [`ciborium`]'s `Value` tree. Decoding
//! walks the map once and matches on tag; any tag it doesn't recognise is
//! silently skipped, so a newer encoder can add a field without breaking
//! an older decoder.

use ciborium::value::Value;

use crate::error::DecodeError;

/// A type that encodes to a tagged CBOR map.
pub trait Encode {
    /// Produce the `Value` tree for this type, typically `Value::Map` of
    /// `(Value::Integer(tag), value)` pairs in ascending tag order.
    fn encode(&self) -> Value;
}

/// A type that decodes from a tagged CBOR map, ignoring unknown tags.
pub trait Decode: Sized {
    /// Reconstruct `Self` from a previously-encoded `Value` tree.
    fn decode(value: &Value) -> Result<Self, DecodeError>;
}

/// Serialise `value` to its canonical binary form.
pub fn encode_to_bytes<T: Encode>(value: &T) -> Vec<u8> {
    let tree = value.encode();
    let mut buf = Vec::new();
    ciborium::into_writer(&tree, &mut buf).expect("encoding a Value tree cannot fail");
    buf
}

/// Deserialise a previously encoded value, rejecting malformed streams but
/// silently skipping any tags the current version of `T` doesn't know
/// about.
pub fn decode_from_bytes<T: Decode>(bytes: &[u8]) -> Result<T, DecodeError> {
    let tree: Value = ciborium::from_reader(bytes)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    T::decode(&tree)
}

/// Build a tagged map from `(tag, value)` pairs.
pub fn tagged_map(fields: Vec<(u64, Value)>) -> Value {
    Value::Map(
        fields
            .into_iter()
            .map(|(tag, v)| (Value::Integer(tag.into()), v))
            .collect(),
    )
}

/// Look up a tag within a decoded map, returning `None` if absent or if
/// the value isn't a map at all.
pub fn get_tag<'a>(value: &'a Value, tag: u64) -> Option<&'a Value> {
    let Value::Map(entries) = value else {
        return None;
    };
    entries.iter().find_map(|(k, v)| {
        let Value::Integer(i) = k else {
            return None;
        };
        (i128::from(*i) == tag as i128).then_some(v)
    })
}

/// Fetch a required tag, mapping absence to [`DecodeError::Malformed`].
pub fn require_tag<'a>(value: &'a Value, tag: u64, field: &str) -> Result<&'a Value, DecodeError> {
    get_tag(value, tag).ok_or_else(|| DecodeError::Malformed(format!("missing field: {field}")))
}

/// Decode a byte-string tag into a fixed-size array.
pub fn bytes_tag<const N: usize>(value: &Value, tag: u64, field: &str) -> Result<[u8; N], DecodeError> {
    let v = require_tag(value, tag, field)?;
    let Value::Bytes(b) = v else {
        return Err(DecodeError::InvalidType(field.to_string()));
    };
    b.as_slice()
        .try_into()
        .map_err(|_| DecodeError::InvalidType(field.to_string()))
}

/// Decode a `u64` tag (CBOR unsigned/negative integer).
pub fn u64_tag(value: &Value, tag: u64, field: &str) -> Result<u64, DecodeError> {
    let v = require_tag(value, tag, field)?;
    let Value::Integer(i) = v else {
        return Err(DecodeError::InvalidType(field.to_string()));
    };
    u64::try_from(*i).map_err(|_| DecodeError::InvalidType(field.to_string()))
}

/// Decode a `u32` tag.
pub fn u32_tag(value: &Value, tag: u64, field: &str) -> Result<u32, DecodeError> {
    u64_tag(value, tag, field).map(|v| v as u32)
}

/// Decode a byte-string tag of unbounded length.
pub fn byte_vec_tag(value: &Value, tag: u64, field: &str) -> Result<Vec<u8>, DecodeError> {
    let v = require_tag(value, tag, field)?;
    let Value::Bytes(b) = v else {
        return Err(DecodeError::InvalidType(field.to_string()));
    };
    Ok(b.clone())
}
