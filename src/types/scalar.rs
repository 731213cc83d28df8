//! Built-in scalar handlers.

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::cursor::FieldCursor;
use super::value::Value;
use super::TypeHandler;

/// Scalar types known without consulting the server catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    Bytea,
    Char,
    Name,
    Int8,
    Int2,
    Int4,
    Text,
    Oid,
    Json,
    Float4,
    Float8,
    Bpchar,
    Varchar,
    Unknown,
}

impl ScalarKind {
    pub const ALL: [ScalarKind; 15] = [
        ScalarKind::Bool,
        ScalarKind::Bytea,
        ScalarKind::Char,
        ScalarKind::Name,
        ScalarKind::Int8,
        ScalarKind::Int2,
        ScalarKind::Int4,
        ScalarKind::Text,
        ScalarKind::Oid,
        ScalarKind::Json,
        ScalarKind::Float4,
        ScalarKind::Float8,
        ScalarKind::Bpchar,
        ScalarKind::Varchar,
        ScalarKind::Unknown,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::Bytea => "bytea",
            ScalarKind::Char => "char",
            ScalarKind::Name => "name",
            ScalarKind::Int8 => "int8",
            ScalarKind::Int2 => "int2",
            ScalarKind::Int4 => "int4",
            ScalarKind::Text => "text",
            ScalarKind::Oid => "oid",
            ScalarKind::Json => "json",
            ScalarKind::Float4 => "float4",
            ScalarKind::Float8 => "float8",
            ScalarKind::Bpchar => "bpchar",
            ScalarKind::Varchar => "varchar",
            ScalarKind::Unknown => "unknown",
        }
    }

    pub fn oid(self) -> Oid {
        match self {
            ScalarKind::Bool => oid::BOOL,
            ScalarKind::Bytea => oid::BYTEA,
            ScalarKind::Char => oid::CHAR,
            ScalarKind::Name => oid::NAME,
            ScalarKind::Int8 => oid::INT8,
            ScalarKind::Int2 => oid::INT2,
            ScalarKind::Int4 => oid::INT4,
            ScalarKind::Text => oid::TEXT,
            ScalarKind::Oid => oid::OID,
            ScalarKind::Json => oid::JSON,
            ScalarKind::Float4 => oid::FLOAT4,
            ScalarKind::Float8 => oid::FLOAT8,
            ScalarKind::Bpchar => oid::BPCHAR,
            ScalarKind::Varchar => oid::VARCHAR,
            ScalarKind::Unknown => oid::UNKNOWN,
        }
    }

    /// OID of the array type over this scalar. `unknown` has none.
    pub fn array_oid(self) -> Option<Oid> {
        Some(match self {
            ScalarKind::Bool => oid::BOOL_ARRAY,
            ScalarKind::Bytea => oid::BYTEA_ARRAY,
            ScalarKind::Char => oid::CHAR_ARRAY,
            ScalarKind::Name => oid::NAME_ARRAY,
            ScalarKind::Int8 => oid::INT8_ARRAY,
            ScalarKind::Int2 => oid::INT2_ARRAY,
            ScalarKind::Int4 => oid::INT4_ARRAY,
            ScalarKind::Text => oid::TEXT_ARRAY,
            ScalarKind::Oid => oid::OID_ARRAY,
            ScalarKind::Json => oid::JSON_ARRAY,
            ScalarKind::Float4 => oid::FLOAT4_ARRAY,
            ScalarKind::Float8 => oid::FLOAT8_ARRAY,
            ScalarKind::Bpchar => oid::BPCHAR_ARRAY,
            ScalarKind::Varchar => oid::VARCHAR_ARRAY,
            ScalarKind::Unknown => return None,
        })
    }

    /// Types whose binary form is plain UTF-8 text.
    fn is_textual(self) -> bool {
        matches!(
            self,
            ScalarKind::Name
                | ScalarKind::Text
                | ScalarKind::Json
                | ScalarKind::Bpchar
                | ScalarKind::Varchar
                | ScalarKind::Unknown
        )
    }
}

/// Handler for one built-in scalar type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarHandler {
    kind: ScalarKind,
}

impl ScalarHandler {
    pub fn new(kind: ScalarKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    fn mismatch(&self, value: &Value) -> Error {
        Error::type_mismatch(self.kind.name(), value.kind_name())
    }
}

impl TypeHandler for ScalarHandler {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn oid(&self) -> Oid {
        self.kind.oid()
    }

    fn validate_and_len(&self, value: &Value) -> Result<usize> {
        let len = match (self.kind, value) {
            (ScalarKind::Bool, Value::Bool(_)) => 1,
            (ScalarKind::Char, Value::Char(_)) => 1,
            (ScalarKind::Char, Value::Text(s)) if s.len() == 1 => 1,
            (ScalarKind::Int2, Value::Int2(_)) => 2,
            (ScalarKind::Int4, Value::Int2(_) | Value::Int4(_)) => 4,
            (ScalarKind::Int8, Value::Int2(_) | Value::Int4(_) | Value::Int8(_)) => 8,
            (ScalarKind::Float4, Value::Float4(_)) => 4,
            (ScalarKind::Float8, Value::Float4(_) | Value::Float8(_)) => 8,
            (ScalarKind::Oid, Value::Oid(_)) => 4,
            (ScalarKind::Bytea, Value::Bytea(bytes)) => bytes.len(),
            (kind, Value::Text(s) | Value::Unknown(s)) if kind.is_textual() => {
                if s.as_bytes().contains(&0) {
                    return Err(Error::Encode(format!(
                        "{} value contains a NUL byte",
                        kind.name()
                    )));
                }
                s.len()
            }
            (_, value) => return Err(self.mismatch(value)),
        };
        Ok(len)
    }

    fn write(&self, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        match (self.kind, value) {
            (ScalarKind::Bool, Value::Bool(v)) => buf.push(*v as u8),
            (ScalarKind::Char, Value::Char(v)) => buf.push(*v),
            (ScalarKind::Char, Value::Text(s)) if s.len() == 1 => buf.extend_from_slice(s.as_bytes()),
            (ScalarKind::Int2, Value::Int2(v)) => buf.extend_from_slice(&v.to_be_bytes()),
            (ScalarKind::Int4, Value::Int2(v)) => buf.extend_from_slice(&(*v as i32).to_be_bytes()),
            (ScalarKind::Int4, Value::Int4(v)) => buf.extend_from_slice(&v.to_be_bytes()),
            (ScalarKind::Int8, Value::Int2(v)) => buf.extend_from_slice(&(*v as i64).to_be_bytes()),
            (ScalarKind::Int8, Value::Int4(v)) => buf.extend_from_slice(&(*v as i64).to_be_bytes()),
            (ScalarKind::Int8, Value::Int8(v)) => buf.extend_from_slice(&v.to_be_bytes()),
            (ScalarKind::Float4, Value::Float4(v)) => buf.extend_from_slice(&v.to_be_bytes()),
            (ScalarKind::Float8, Value::Float4(v)) => buf.extend_from_slice(&(*v as f64).to_be_bytes()),
            (ScalarKind::Float8, Value::Float8(v)) => buf.extend_from_slice(&v.to_be_bytes()),
            (ScalarKind::Oid, Value::Oid(v)) => buf.extend_from_slice(&v.to_be_bytes()),
            (ScalarKind::Bytea, Value::Bytea(bytes)) => buf.extend_from_slice(bytes),
            (kind, Value::Text(s) | Value::Unknown(s)) if kind.is_textual() => {
                buf.extend_from_slice(s.as_bytes())
            }
            (_, value) => return Err(self.mismatch(value)),
        }
        Ok(())
    }

    fn read_binary(&self, cursor: &mut FieldCursor<'_>) -> Result<Value> {
        Ok(match self.kind {
            ScalarKind::Bool => Value::Bool(cursor.read_u8()? != 0),
            ScalarKind::Char => Value::Char(cursor.read_u8()?),
            ScalarKind::Int2 => Value::Int2(cursor.read_i16()?),
            ScalarKind::Int4 => Value::Int4(cursor.read_i32()?),
            ScalarKind::Int8 => Value::Int8(cursor.read_i64()?),
            ScalarKind::Float4 => Value::Float4(cursor.read_f32()?),
            ScalarKind::Float8 => Value::Float8(cursor.read_f64()?),
            ScalarKind::Oid => Value::Oid(cursor.read_u32()?),
            ScalarKind::Bytea => Value::Bytea(cursor.read_rest().to_vec()),
            _ => Value::Text(decode_utf8(cursor.read_rest())?.to_string()),
        })
    }

    fn read_text(&self, text: &str) -> Result<Value> {
        Ok(match self.kind {
            ScalarKind::Bool => Value::Bool(parse_bool(text)?),
            ScalarKind::Char => Value::Char(text.as_bytes().first().copied().unwrap_or(0)),
            ScalarKind::Int2 => Value::Int2(parse_number(text, "int2")?),
            ScalarKind::Int4 => Value::Int4(parse_number(text, "int4")?),
            ScalarKind::Int8 => Value::Int8(parse_number(text, "int8")?),
            ScalarKind::Oid => Value::Oid(parse_number(text, "oid")?),
            ScalarKind::Float4 => Value::Float4(parse_float(text)? as f32),
            ScalarKind::Float8 => Value::Float8(parse_float(text)?),
            ScalarKind::Bytea => Value::Bytea(parse_bytea(text)?),
            _ => Value::Text(text.to_string()),
        })
    }
}

pub(crate) fn decode_utf8(bytes: &[u8]) -> Result<&str> {
    simdutf8::compat::from_utf8(bytes).map_err(|e| Error::Decode(format!("invalid UTF-8: {}", e)))
}

fn parse_bool(text: &str) -> Result<bool> {
    match text {
        "t" | "true" | "TRUE" | "T" | "1" => Ok(true),
        "f" | "false" | "FALSE" | "F" | "0" => Ok(false),
        _ => Err(Error::Decode(format!("invalid boolean: {:?}", text))),
    }
}

fn parse_number<T: std::str::FromStr>(text: &str, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    text.trim()
        .parse()
        .map_err(|e| Error::Decode(format!("invalid {} {:?}: {}", name, text, e)))
}

/// Float text as the server prints it, including `NaN` and `Infinity`.
pub(crate) fn parse_float(text: &str) -> Result<f64> {
    match text.trim() {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        other => other
            .parse()
            .map_err(|e| Error::Decode(format!("invalid float {:?}: {}", text, e))),
    }
}

/// Bytea text in either hex (`\x0a0b`) or escape (`a\\\012`) output format.
fn parse_bytea(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    if let Some(hex) = bytes.strip_prefix(b"\\x") {
        return decode_hex(hex);
    }

    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
        } else if bytes.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else {
            let digits = bytes
                .get(i + 1..i + 4)
                .filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)))
                .ok_or_else(|| Error::Decode(format!("invalid bytea escape at offset {}", i)))?;
            let value = digits.iter().fold(0u16, |acc, d| acc * 8 + (d - b'0') as u16);
            out.push(u8::try_from(value).map_err(|_| {
                Error::Decode(format!("bytea escape out of range at offset {}", i))
            })?);
            i += 4;
        }
    }
    Ok(out)
}

fn decode_hex(hex: &[u8]) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(Error::Decode("invalid hex length".into()));
    }
    hex.chunks(2)
        .map(|pair| Ok((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
        .collect()
}

fn hex_digit(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(Error::Decode(format!("invalid hex digit: {}", b as char))),
    }
}
