//! Per-connector OID and name lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::types::{FormatCode, Oid, oid};

use super::enums::EnumHandler;
use super::geometric::{GeometricHandler, GeometricKind};
use super::scalar::{ScalarHandler, ScalarKind, decode_utf8};
use super::value::Value;
use super::{ArrayHandler, Handler, TypeHandler, read_field};

/// SQL spellings that name a built-in type.
const ALIASES: &[(&str, &str)] = &[
    ("boolean", "bool"),
    ("smallint", "int2"),
    ("integer", "int4"),
    ("int", "int4"),
    ("bigint", "int8"),
    ("real", "float4"),
    ("double precision", "float8"),
    ("character varying", "varchar"),
    ("character", "bpchar"),
];

/// Handlers known to one connector.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    by_oid: HashMap<Oid, Arc<Handler>>,
    by_name: HashMap<String, Arc<Handler>>,
    /// element OID -> array OID
    array_of: HashMap<Oid, Oid>,
}

impl TypeRegistry {
    /// Registry with no handlers at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in scalar and geometric handlers plus arrays of each.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for kind in ScalarKind::ALL {
            let element = registry.register(Handler::Scalar(ScalarHandler::new(kind)));
            if let Some(array_oid) = kind.array_oid() {
                registry.register_array_of(array_oid, element);
            }
        }
        for kind in GeometricKind::ALL {
            let element = registry.register(Handler::Geometric(GeometricHandler::new(kind)));
            registry.register_array_of(kind.array_oid(), element);
        }
        registry
    }

    /// Register a handler under its OID and name, replacing any previous one.
    pub fn register(&mut self, handler: Handler) -> Arc<Handler> {
        let handler = Arc::new(handler);
        self.by_oid.insert(handler.oid(), Arc::clone(&handler));
        self.by_name
            .insert(handler.name().to_string(), Arc::clone(&handler));
        handler
    }

    /// Register an array type over an already registered element type.
    pub fn register_array(&mut self, array_oid: Oid, element_oid: Oid) -> Result<Arc<Handler>> {
        let element = self.by_oid.get(&element_oid).cloned().ok_or_else(|| {
            Error::InvalidUsage(format!(
                "cannot register array {}: element oid {} has no handler",
                array_oid, element_oid
            ))
        })?;
        Ok(self.register_array_of(array_oid, element))
    }

    fn register_array_of(&mut self, array_oid: Oid, element: Arc<Handler>) -> Arc<Handler> {
        self.array_of.insert(element.oid(), array_oid);
        self.register(Handler::Array(ArrayHandler::new(array_oid, element)))
    }

    /// Register an enum and, when the server reported one, its array type.
    pub fn register_enum(
        &mut self,
        name: &str,
        oid: Oid,
        array_oid: Option<Oid>,
        labels: Vec<String>,
    ) -> Arc<Handler> {
        let handler = self.register(Handler::Enum(EnumHandler::new(name, oid, labels)));
        if let Some(array_oid) = array_oid.filter(|&o| o != 0) {
            self.register_array_of(array_oid, Arc::clone(&handler));
        }
        tracing::debug!(name, oid, "registered enum type");
        handler
    }

    pub fn get(&self, oid: Oid) -> Option<&Arc<Handler>> {
        self.by_oid.get(&oid)
    }

    /// Look up by type name. Accepts `int4[]` for `_int4` and common SQL aliases.
    pub fn get_by_name(&self, name: &str) -> Option<&Arc<Handler>> {
        if let Some(element) = name.strip_suffix("[]") {
            let element = self.get_by_name(element.trim_end())?;
            let array_oid = self.array_of.get(&element.oid())?;
            return self.by_oid.get(array_oid);
        }
        let name = ALIASES
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
            .map_or(name, |&(_, canonical)| canonical);
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_oid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_oid.is_empty()
    }

    /// OID a value is sent as when the statement does not fix the parameter type.
    ///
    /// Text is left unspecified so the server infers it from context.
    pub fn natural_oid(&self, value: &Value) -> Oid {
        match value {
            Value::Null | Value::Text(_) | Value::Unknown(_) => 0,
            Value::Bool(_) => oid::BOOL,
            Value::Char(_) => oid::CHAR,
            Value::Int2(_) => oid::INT2,
            Value::Int4(_) => oid::INT4,
            Value::Int8(_) => oid::INT8,
            Value::Float4(_) => oid::FLOAT4,
            Value::Float8(_) => oid::FLOAT8,
            Value::Oid(_) => oid::OID,
            Value::Bytea(_) => oid::BYTEA,
            Value::Point(_) => oid::POINT,
            Value::LSeg(_) => oid::LSEG,
            Value::Box(_) => oid::BOX,
            Value::Circle(_) => oid::CIRCLE,
            Value::Enum(e) => self.get_by_name(&e.type_name).map_or(0, |h| h.oid()),
            Value::Array(array) => {
                let element_oid = array
                    .elements()
                    .iter()
                    .find(|v| !v.is_null())
                    .map_or(0, |v| match v {
                        Value::Text(_) => oid::TEXT,
                        other => self.natural_oid(other),
                    });
                self.array_of.get(&element_oid).copied().unwrap_or(0)
            }
        }
    }

    /// Handler used when a value is written without a declared column type.
    pub fn handler_for_value(&self, value: &Value) -> Result<Arc<Handler>> {
        let oid = match value {
            Value::Text(_) | Value::Unknown(_) => oid::TEXT,
            other => self.natural_oid(other),
        };
        self.get(oid).cloned().ok_or_else(|| {
            Error::Encode(format!("no type handler for {} value", value.kind_name()))
        })
    }

    /// Result format to request for a column: binary when a handler exists.
    pub fn result_format(&self, oid: Oid) -> FormatCode {
        if self.by_oid.contains_key(&oid) {
            FormatCode::Binary
        } else {
            FormatCode::Text
        }
    }

    /// Decode one column value.
    ///
    /// Text columns without a handler come back as [`Value::Unknown`]; a binary
    /// column without one is an error.
    pub fn decode(&self, type_oid: Oid, format: FormatCode, raw: Option<&[u8]>) -> Result<Value> {
        let Some(data) = raw else {
            return Ok(Value::Null);
        };
        match format {
            FormatCode::Binary => {
                let handler = self.get(type_oid).ok_or_else(|| Error::no_handler(type_oid))?;
                read_field(handler, data)
            }
            FormatCode::Text => {
                let text = decode_utf8(data)?;
                match self.get(type_oid) {
                    Some(handler) => handler.read_text(text),
                    None => Ok(Value::Unknown(text.to_string())),
                }
            }
        }
    }

    /// Validate and length-prefix one value.
    pub fn encode_field(&self, handler: &Handler, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        if value.is_null() {
            buf.extend_from_slice(&(-1_i32).to_be_bytes());
            return Ok(());
        }
        let len = handler.validate_and_len(value)?;
        let len_i32 = i32::try_from(len)
            .map_err(|_| Error::Encode(format!("{} value of {} bytes is too large", handler.name(), len)))?;
        buf.extend_from_slice(&len_i32.to_be_bytes());
        write_checked(handler, value, len, buf)
    }

    /// Validate every parameter against the server-declared types before
    /// anything is written.
    pub(crate) fn plan_params(&self, param_oids: &[Oid], values: &[Value]) -> Result<ParamPlan> {
        if param_oids.len() != values.len() {
            return Err(Error::InvalidUsage(format!(
                "statement expects {} parameters, {} were given",
                param_oids.len(),
                values.len()
            )));
        }
        let mut entries = Vec::with_capacity(values.len());
        for (index, (&type_oid, value)) in param_oids.iter().zip(values).enumerate() {
            let entry = match (value, self.get(type_oid)) {
                (Value::Null, _) => PlannedParam {
                    handler: None,
                    len: None,
                    format: FormatCode::Binary,
                },
                (value, Some(handler)) => {
                    let len = handler.validate_and_len(value).map_err(|e| match e {
                        Error::Encode(msg) => Error::Encode(format!("parameter ${}: {}", index + 1, msg)),
                        other => other,
                    })?;
                    PlannedParam {
                        handler: Some(Arc::clone(handler)),
                        len: Some(len),
                        format: FormatCode::Binary,
                    }
                }
                // No handler: text values are handed to the server's input function.
                (Value::Text(s) | Value::Unknown(s), None) => PlannedParam {
                    handler: None,
                    len: Some(s.len()),
                    format: FormatCode::Text,
                },
                (value, None) => {
                    return Err(Error::Encode(format!(
                        "parameter ${}: no type handler for oid {} to write {} value",
                        index + 1,
                        type_oid,
                        value.kind_name()
                    )));
                }
            };
            if entry.len.is_some_and(|len| len > i32::MAX as usize) {
                return Err(Error::Encode(format!("parameter ${} is too large", index + 1)));
            }
            entries.push(entry);
        }
        Ok(ParamPlan { entries })
    }
}

fn write_checked(handler: &Handler, value: &Value, len: usize, buf: &mut Vec<u8>) -> Result<()> {
    let start = buf.len();
    handler.write(value, buf)?;
    let written = buf.len() - start;
    if written != len {
        return Err(Error::Encode(format!(
            "{} handler wrote {} bytes after declaring {}",
            handler.name(),
            written,
            len
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct PlannedParam {
    handler: Option<Arc<Handler>>,
    /// None for NULL
    len: Option<usize>,
    format: FormatCode,
}

/// Parameters validated against their target types, ready for a Bind message.
#[derive(Debug)]
pub(crate) struct ParamPlan {
    entries: Vec<PlannedParam>,
}

impl ParamPlan {
    pub fn formats(&self) -> Vec<FormatCode> {
        self.entries.iter().map(|e| e.format).collect()
    }

    /// Write the length-prefixed values. `values` must be the slice that was planned.
    pub fn write(&self, values: &[Value], buf: &mut Vec<u8>) -> Result<()> {
        for (entry, value) in self.entries.iter().zip(values) {
            let Some(len) = entry.len else {
                buf.extend_from_slice(&(-1_i32).to_be_bytes());
                continue;
            };
            buf.extend_from_slice(&(len as i32).to_be_bytes());
            match (&entry.handler, value) {
                (Some(handler), value) => write_checked(handler, value, len, buf)?,
                (None, Value::Text(s) | Value::Unknown(s)) => buf.extend_from_slice(s.as_bytes()),
                (None, other) => {
                    return Err(Error::Encode(format!(
                        "{} value changed after validation",
                        other.kind_name()
                    )));
                }
            }
        }
        Ok(())
    }
}
