//! Enum handlers and the process-wide enum registrations.

use std::collections::BTreeMap;
use std::sync::{LazyLock, RwLock};

use crate::error::{Error, Result};
use crate::protocol::types::Oid;

use super::TypeHandler;
use super::cursor::FieldCursor;
use super::scalar::decode_utf8;
use super::value::{EnumValue, PgEnum, Value};

/// Handler for a server-side enum type with a closed set of labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumHandler {
    name: String,
    oid: Oid,
    labels: Vec<String>,
}

impl EnumHandler {
    pub fn new(name: impl Into<String>, oid: Oid, labels: Vec<String>) -> Self {
        Self {
            name: name.into(),
            oid,
            labels,
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    fn check_label<'v>(&self, value: &'v Value) -> Result<&'v str> {
        let label = match value {
            Value::Enum(e) => {
                if e.type_name != self.name {
                    return Err(Error::Encode(format!(
                        "value of enum {} cannot be written as {}",
                        e.type_name, self.name
                    )));
                }
                e.label.as_str()
            }
            Value::Text(s) => s.as_str(),
            other => return Err(Error::type_mismatch(&self.name, other.kind_name())),
        };
        if !self.labels.iter().any(|l| l == label) {
            return Err(Error::Encode(format!(
                "label {:?} is not part of enum {}",
                label, self.name
            )));
        }
        Ok(label)
    }

    fn decode_label(&self, label: &str) -> Result<Value> {
        if !self.labels.iter().any(|l| l == label) {
            return Err(Error::Decode(format!(
                "server returned label {:?} unknown to enum {}",
                label, self.name
            )));
        }
        Ok(Value::Enum(EnumValue::new(self.name.clone(), label)))
    }
}

impl TypeHandler for EnumHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn oid(&self) -> Oid {
        self.oid
    }

    fn validate_and_len(&self, value: &Value) -> Result<usize> {
        self.check_label(value).map(str::len)
    }

    fn write(&self, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(self.check_label(value)?.as_bytes());
        Ok(())
    }

    fn read_binary(&self, cursor: &mut FieldCursor<'_>) -> Result<Value> {
        self.decode_label(decode_utf8(cursor.read_rest())?)
    }

    fn read_text(&self, text: &str) -> Result<Value> {
        self.decode_label(text)
    }
}

static GLOBAL_ENUMS: LazyLock<RwLock<BTreeMap<String, Vec<String>>>> =
    LazyLock::new(|| RwLock::new(BTreeMap::new()));

/// Register an enum for every connector opened from now on.
///
/// Connectors already open are unaffected until [`reload_types`] is called on them.
///
/// [`reload_types`]: crate::Connector::reload_types
pub fn register_enum_globally(pg_name: &str, labels: &[&str]) {
    let labels = labels.iter().map(|l| l.to_string()).collect();
    GLOBAL_ENUMS
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(pg_name.to_string(), labels);
}

/// Register a [`PgEnum`] for every connector opened from now on.
pub fn register_pg_enum_globally<T: PgEnum>() {
    register_enum_globally(T::TYPE_NAME, T::LABELS);
}

/// Remove a global enum registration. Returns false if none existed.
pub fn unregister_enum_globally(pg_name: &str) -> bool {
    GLOBAL_ENUMS
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .remove(pg_name)
        .is_some()
}

/// Remove every global type registration.
pub fn clear_global_types() {
    GLOBAL_ENUMS.write().unwrap_or_else(|e| e.into_inner()).clear();
}

/// Snapshot of the global enum registrations.
pub(crate) fn global_enums() -> Vec<(String, Vec<String>)> {
    GLOBAL_ENUMS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .map(|(name, labels)| (name.clone(), labels.clone()))
        .collect()
}
