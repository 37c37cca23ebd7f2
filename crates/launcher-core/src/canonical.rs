//! Canonical JSON encoding for signature payloads.
//!
//! The manifest signature covers a deterministic byte encoding of the
//! unsigned manifest so that the publisher and every launcher agree
//! bit-for-bit on the signed message, regardless of runtime or JSON library:
//!
//! - Object keys are sorted by Unicode code point (byte order for UTF-8).
//! - No whitespace between tokens, no trailing newline.
//! - Strings are UTF-8 with minimal escaping: only `"`, `\`, and the control
//!   characters U+0000..=U+001F are escaped, using the short escapes
//!   `\b \f \n \r \t` where JSON defines them and `\uXXXX` otherwise.
//!   Non-ASCII characters are emitted raw.
//! - Integers are emitted in plain decimal. Floats are rejected: the
//!   manifest payloads use strings and integers exclusively, and float
//!   formatting is where cross-runtime encoders disagree.
//! - Arrays preserve element order; booleans and nulls use the JSON
//!   literals.
//!
//! The encoding applies recursively to nested values.

use std::fmt::Write as _;

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Errors that can occur while canonically encoding a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanonicalError {
    /// A floating-point number was encountered.
    #[error("float not allowed: canonical payloads are integer-only")]
    FloatNotAllowed,
}

/// Encodes a JSON value into its canonical byte sequence.
///
/// # Errors
///
/// Returns [`CanonicalError::FloatNotAllowed`] if the value contains a
/// number that is not representable as an integer.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    canonical_string(value).map(String::into_bytes)
}

/// Encodes a JSON value into its canonical string form.
///
/// # Errors
///
/// Returns [`CanonicalError::FloatNotAllowed`] if the value contains a
/// number that is not representable as an integer.
pub fn canonical_string(value: &Value) -> Result<String, CanonicalError> {
    let mut output = String::new();
    emit_value(value, &mut output)?;
    Ok(output)
}

fn emit_value(value: &Value, output: &mut String) -> Result<(), CanonicalError> {
    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, output)?,
        Value::String(s) => emit_string(s, output),
        Value::Array(arr) => emit_array(arr, output)?,
        Value::Object(obj) => emit_object(obj, output)?,
    }
    Ok(())
}

fn emit_number(n: &Number, output: &mut String) -> Result<(), CanonicalError> {
    if let Some(i) = n.as_i64() {
        let _ = write!(output, "{i}");
        Ok(())
    } else if let Some(u) = n.as_u64() {
        let _ = write!(output, "{u}");
        Ok(())
    } else {
        Err(CanonicalError::FloatNotAllowed)
    }
}

/// Emits a string with minimal escaping.
///
/// Only `"`, `\`, and U+0000..=U+001F are escaped; everything else is
/// emitted as-is so the output stays byte-compatible with encoders that do
/// not over-escape ASCII punctuation or non-ASCII text.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            },
            c => output.push(c),
        }
    }
    output.push('"');
}

fn emit_array(arr: &[Value], output: &mut String) -> Result<(), CanonicalError> {
    output.push('[');
    for (i, item) in arr.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_value(item, output)?;
    }
    output.push(']');
    Ok(())
}

fn emit_object(obj: &Map<String, Value>, output: &mut String) -> Result<(), CanonicalError> {
    // Byte-order sort over UTF-8 equals code-point order.
    let mut sorted_keys: Vec<&String> = obj.keys().collect();
    sorted_keys.sort();

    output.push('{');
    for (i, key) in sorted_keys.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(&obj[*key], output)?;
    }
    output.push('}');
    Ok(())
}
