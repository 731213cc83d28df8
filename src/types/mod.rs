//! Type codec registry.
//!
//! Every value crossing the wire goes through a [`Handler`]: a closed set of
//! built-in scalar and geometric codecs, enums with a fixed label set, and
//! arrays wrapping any of them. Each connector owns a [`TypeRegistry`] seeded
//! from the built-ins plus the global enum registrations.

pub mod array;
pub mod cursor;
pub mod enums;
pub mod geometric;
mod registry;
pub mod scalar;
pub mod value;

pub use array::ArrayHandler;
pub use cursor::FieldCursor;
pub use enums::{
    EnumHandler, clear_global_types, register_enum_globally, register_pg_enum_globally,
    unregister_enum_globally,
};
pub use geometric::{GeometricHandler, GeometricKind};
pub use registry::TypeRegistry;
pub use scalar::{ScalarHandler, ScalarKind};
pub use value::{
    ArrayDim, ArrayValue, Circle, EnumValue, FromValue, LSeg, PgBox, PgEnum, Point, Value,
};

use crate::error::Result;
use crate::protocol::types::Oid;

/// A wire codec for one server type.
///
/// Writing is two-phase: [`TypeHandler::validate_and_len`] checks the value
/// and reports its encoded length before anything is placed in a message,
/// then [`TypeHandler::write`] appends exactly that many bytes.
pub trait TypeHandler {
    /// Server type name
    fn name(&self) -> &str;

    /// Server type OID
    fn oid(&self) -> Oid;

    /// Element delimiter in the text form of arrays of this type.
    fn delimiter(&self) -> u8 {
        b','
    }

    /// Check that `value` can be written and return its binary length.
    fn validate_and_len(&self, value: &Value) -> Result<usize>;

    /// Append the binary form of `value`, without length prefix.
    fn write(&self, value: &Value, buf: &mut Vec<u8>) -> Result<()>;

    /// Read a binary value. The cursor ends at the field boundary.
    fn read_binary(&self, cursor: &mut FieldCursor<'_>) -> Result<Value>;

    /// Parse the text form.
    fn read_text(&self, text: &str) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub enum Handler {
    Scalar(ScalarHandler),
    Geometric(GeometricHandler),
    Enum(EnumHandler),
    Array(ArrayHandler),
}

macro_rules! dispatch {
    ($self:ident, $h:ident => $body:expr) => {
        match $self {
            Handler::Scalar($h) => $body,
            Handler::Geometric($h) => $body,
            Handler::Enum($h) => $body,
            Handler::Array($h) => $body,
        }
    };
}

impl TypeHandler for Handler {
    fn name(&self) -> &str {
        dispatch!(self, h => h.name())
    }

    fn oid(&self) -> Oid {
        dispatch!(self, h => h.oid())
    }

    fn delimiter(&self) -> u8 {
        dispatch!(self, h => h.delimiter())
    }

    fn validate_and_len(&self, value: &Value) -> Result<usize> {
        dispatch!(self, h => h.validate_and_len(value))
    }

    fn write(&self, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        dispatch!(self, h => h.write(value, buf))
    }

    fn read_binary(&self, cursor: &mut FieldCursor<'_>) -> Result<Value> {
        dispatch!(self, h => h.read_binary(cursor))
    }

    fn read_text(&self, text: &str) -> Result<Value> {
        dispatch!(self, h => h.read_text(text))
    }
}

/// Decode one binary field of exactly `data.len()` bytes.
///
/// The caller has already advanced past the field, so a handler that reads
/// less than the declared length cannot desynchronize the stream.
pub(crate) fn read_field(handler: &Handler, data: &[u8]) -> Result<Value> {
    let mut cursor = FieldCursor::new(data);
    let value = handler.read_binary(&mut cursor)?;
    if cursor.remaining() > 0 {
        tracing::warn!(
            handler = handler.name(),
            declared = data.len(),
            unread = cursor.remaining(),
            "type handler left part of a field unread"
        );
    }
    Ok(value)
}
