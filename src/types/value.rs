//! Decoded column and parameter values.

use crate::error::{Error, Result};
use crate::protocol::types::Oid;

/// A point on a plane.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A finite line segment.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LSeg {
    pub start: Point,
    pub end: Point,
}

impl LSeg {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }
}

/// A rectangular box, stored the way the server normalizes it: upper-right
/// corner first, lower-left corner second.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PgBox {
    pub high: Point,
    pub low: Point,
}

impl PgBox {
    /// Build a box from any two opposite corners.
    pub fn new(a: Point, b: Point) -> Self {
        Self {
            high: Point::new(a.x.max(b.x), a.y.max(b.y)),
            low: Point::new(a.x.min(b.x), a.y.min(b.y)),
        }
    }
}

/// A circle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Circle {
    pub center: Point,
    pub radius: f64,
}

impl Circle {
    pub fn new(center: Point, radius: f64) -> Self {
        Self { center, radius }
    }
}

/// A label of a server-side enum type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumValue {
    /// Name of the enum type as registered (e.g. `mood` or `app.mood`)
    pub type_name: String,
    /// The label
    pub label: String,
}

impl EnumValue {
    pub fn new(type_name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            label: label.into(),
        }
    }
}

/// Rust enums that mirror a server-side enum type.
///
/// ```
/// use pgconnector::types::PgEnum;
///
/// #[derive(Debug, PartialEq)]
/// enum Mood { Sad, Happy }
///
/// impl PgEnum for Mood {
///     const TYPE_NAME: &'static str = "mood";
///     const LABELS: &'static [&'static str] = &["sad", "happy"];
///
///     fn label(&self) -> &'static str {
///         match self { Mood::Sad => "sad", Mood::Happy => "happy" }
///     }
///
///     fn from_label(label: &str) -> Option<Self> {
///         match label { "sad" => Some(Mood::Sad), "happy" => Some(Mood::Happy), _ => None }
///     }
/// }
/// ```
pub trait PgEnum: Sized {
    /// Server-side type name
    const TYPE_NAME: &'static str;
    /// Every label, in server sort order
    const LABELS: &'static [&'static str];

    fn label(&self) -> &'static str;

    fn from_label(label: &str) -> Option<Self>;

    /// Convert into a parameter value.
    fn to_value(&self) -> Value {
        Value::Enum(EnumValue::new(Self::TYPE_NAME, self.label()))
    }

    /// Convert a decoded value back, failing on labels outside the set.
    fn from_value(value: &Value) -> Result<Self> {
        let label = match value {
            Value::Enum(e) => e.label.as_str(),
            Value::Text(s) | Value::Unknown(s) => s.as_str(),
            other => return Err(Error::Decode(format!(
                "expected {} enum, got {}",
                Self::TYPE_NAME,
                other.kind_name()
            ))),
        };
        Self::from_label(label).ok_or_else(|| {
            Error::Decode(format!("label {:?} is not part of enum {}", label, Self::TYPE_NAME))
        })
    }
}

/// One dimension of an array value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDim {
    pub len: i32,
    pub lower_bound: i32,
}

/// A possibly multi-dimensional array, elements stored in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    dims: Vec<ArrayDim>,
    elements: Vec<Value>,
}

impl ArrayValue {
    /// One-dimensional array with the conventional lower bound of 1.
    pub fn from_vec(elements: Vec<Value>) -> Self {
        let dims = if elements.is_empty() {
            Vec::new()
        } else {
            vec![ArrayDim {
                len: elements.len() as i32,
                lower_bound: 1,
            }]
        };
        Self { dims, elements }
    }

    /// Array with explicit dimensions. The element count must match their product.
    pub fn new(dims: Vec<ArrayDim>, elements: Vec<Value>) -> Result<Self> {
        let expected = dims
            .iter()
            .try_fold(1usize, |acc, d| {
                usize::try_from(d.len).ok().and_then(|len| acc.checked_mul(len))
            })
            .ok_or_else(|| Error::Encode("invalid array dimensions".into()))?;
        let expected = if dims.is_empty() { 0 } else { expected };
        if expected != elements.len() {
            return Err(Error::Encode(format!(
                "array dimensions describe {} elements but {} were given",
                expected,
                elements.len()
            )));
        }
        Ok(Self { dims, elements })
    }

    /// Decoders have already checked the shape.
    pub(crate) fn from_parts(dims: Vec<ArrayDim>, elements: Vec<Value>) -> Self {
        Self { dims, elements }
    }

    pub fn dims(&self) -> &[ArrayDim] {
        &self.dims
    }

    pub fn elements(&self) -> &[Value] {
        &self.elements
    }

    pub fn into_elements(self) -> Vec<Value> {
        self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<T: Into<Value>> FromIterator<T> for ArrayValue {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().map(Into::into).collect())
    }
}

/// A decoded column value or an encodable parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// The single-byte `"char"` type
    Char(u8),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Oid(Oid),
    Text(String),
    Bytea(Vec<u8>),
    Point(Point),
    LSeg(LSeg),
    Box(PgBox),
    Circle(Circle),
    Enum(EnumValue),
    Array(ArrayValue),
    /// Text of a column whose type has no registered handler
    Unknown(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Char(_) => "char",
            Value::Int2(_) => "int2",
            Value::Int4(_) => "int4",
            Value::Int8(_) => "int8",
            Value::Float4(_) => "float4",
            Value::Float8(_) => "float8",
            Value::Oid(_) => "oid",
            Value::Text(_) => "text",
            Value::Bytea(_) => "bytea",
            Value::Point(_) => "point",
            Value::LSeg(_) => "lseg",
            Value::Box(_) => "box",
            Value::Circle(_) => "circle",
            Value::Enum(_) => "enum",
            Value::Array(_) => "array",
            Value::Unknown(_) => "unknown",
        }
    }

    /// Typed access.
    pub fn get<T: FromValue>(&self) -> Result<T> {
        T::from_value(self)
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

value_from!(
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    Vec<u8> => Bytea,
    Point => Point,
    LSeg => LSeg,
    PgBox => Box,
    Circle => Circle,
    EnumValue => Enum,
    ArrayValue => Array,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytea(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Conversion from a decoded [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch<T>(expected: &str, value: &Value) -> Result<T> {
    Err(Error::Decode(format!(
        "cannot read {} value as {}",
        value.kind_name(),
        expected
    )))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(v) => Ok(*v),
            other => mismatch("bool", other),
        }
    }
}

impl FromValue for i16 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int2(v) => Ok(*v),
            other => mismatch("i16", other),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int2(v) => Ok(*v as i32),
            Value::Int4(v) => Ok(*v),
            other => mismatch("i32", other),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int2(v) => Ok(*v as i64),
            Value::Int4(v) => Ok(*v as i64),
            Value::Int8(v) => Ok(*v),
            Value::Oid(v) => Ok(*v as i64),
            other => mismatch("i64", other),
        }
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Oid(v) => Ok(*v),
            other => mismatch("u32", other),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float4(v) => Ok(*v),
            other => mismatch("f32", other),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float4(v) => Ok(*v as f64),
            Value::Float8(v) => Ok(*v),
            other => mismatch("f64", other),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) | Value::Unknown(s) => Ok(s.clone()),
            Value::Enum(e) => Ok(e.label.clone()),
            other => mismatch("String", other),
        }
    }
}

// `u8` has no `FromValue` impl: `Vec<u8>` is bytea, never `"char"[]`.
impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytea(v) => Ok(v.clone()),
            other => mismatch("Vec<u8>", other),
        }
    }
}

impl FromValue for Point {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Point(v) => Ok(*v),
            other => mismatch("Point", other),
        }
    }
}

impl FromValue for LSeg {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::LSeg(v) => Ok(*v),
            other => mismatch("LSeg", other),
        }
    }
}

impl FromValue for PgBox {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Box(v) => Ok(*v),
            other => mismatch("PgBox", other),
        }
    }
}

impl FromValue for Circle {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Circle(v) => Ok(*v),
            other => mismatch("Circle", other),
        }
    }
}

impl FromValue for EnumValue {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Enum(v) => Ok(v.clone()),
            other => mismatch("EnumValue", other),
        }
    }
}

impl FromValue for ArrayValue {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Array(v) => Ok(v.clone()),
            other => mismatch("ArrayValue", other),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Flattens the array in row-major order.
impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Array(array) => array.elements().iter().map(T::from_value).collect(),
            other => mismatch("Vec", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widening_reads() {
        assert_eq!(Value::Int2(7).get::<i64>().unwrap(), 7);
        assert_eq!(Value::Float4(1.5).get::<f64>().unwrap(), 1.5);
        assert!(Value::Int8(7).get::<i32>().is_err());
    }

    #[test]
    fn test_option_and_null() {
        assert_eq!(Value::Null.get::<Option<i32>>().unwrap(), None);
        assert_eq!(Value::Int4(3).get::<Option<i32>>().unwrap(), Some(3));
        assert!(Value::Null.get::<i32>().is_err());
        assert_eq!(Value::from(None::<i32>), Value::Null);
    }

    #[test]
    fn test_vec_u8_is_bytea() {
        assert_eq!(Value::Bytea(vec![1, 2]).get::<Vec<u8>>().unwrap(), vec![1, 2]);
        let chars: ArrayValue = vec![Value::Char(b'a')].into_iter().collect();
        assert!(Value::Array(chars).get::<Vec<u8>>().is_err());
    }

    #[test]
    fn test_array_construction() {
        let array: ArrayValue = vec![1i32, 2, 3].into_iter().collect();
        assert_eq!(array.dims(), &[ArrayDim { len: 3, lower_bound: 1 }]);
        assert_eq!(Value::Array(array).get::<Vec<i32>>().unwrap(), vec![1, 2, 3]);

        assert!(ArrayValue::from_vec(Vec::new()).dims().is_empty());
        let dims = vec![ArrayDim { len: 2, lower_bound: 1 }, ArrayDim { len: 2, lower_bound: 1 }];
        assert!(ArrayValue::new(dims.clone(), vec![Value::Int4(1); 4]).is_ok());
        assert!(ArrayValue::new(dims, vec![Value::Int4(1); 3]).is_err());
    }

    #[test]
    fn test_box_normalizes_corners() {
        let b = PgBox::new(Point::new(1.0, 5.0), Point::new(3.0, 2.0));
        assert_eq!(b.high, Point::new(3.0, 5.0));
        assert_eq!(b.low, Point::new(1.0, 2.0));
    }

    #[derive(Debug, PartialEq)]
    enum Mood {
        Sad,
        Happy,
    }

    impl PgEnum for Mood {
        const TYPE_NAME: &'static str = "mood";
        const LABELS: &'static [&'static str] = &["sad", "happy"];

        fn label(&self) -> &'static str {
            match self {
                Mood::Sad => "sad",
                Mood::Happy => "happy",
            }
        }

        fn from_label(label: &str) -> Option<Self> {
            match label {
                "sad" => Some(Mood::Sad),
                "happy" => Some(Mood::Happy),
                _ => None,
            }
        }
    }

    #[test]
    fn test_pg_enum_conversion() {
        let value = Mood::Happy.to_value();
        assert_eq!(value, Value::Enum(EnumValue::new("mood", "happy")));
        assert_eq!(Mood::from_value(&value).unwrap(), Mood::Happy);
        assert!(Mood::from_value(&Value::Enum(EnumValue::new("mood", "angry"))).is_err());
    }
}
