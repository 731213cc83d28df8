//! Geometric handlers: point, lseg, box, circle.

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::TypeHandler;
use super::cursor::FieldCursor;
use super::value::{Circle, LSeg, PgBox, Point, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometricKind {
    Point,
    LSeg,
    Box,
    Circle,
}

impl GeometricKind {
    pub const ALL: [GeometricKind; 4] = [
        GeometricKind::Point,
        GeometricKind::LSeg,
        GeometricKind::Box,
        GeometricKind::Circle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GeometricKind::Point => "point",
            GeometricKind::LSeg => "lseg",
            GeometricKind::Box => "box",
            GeometricKind::Circle => "circle",
        }
    }

    pub fn oid(self) -> Oid {
        match self {
            GeometricKind::Point => oid::POINT,
            GeometricKind::LSeg => oid::LSEG,
            GeometricKind::Box => oid::BOX,
            GeometricKind::Circle => oid::CIRCLE,
        }
    }

    pub fn array_oid(self) -> Oid {
        match self {
            GeometricKind::Point => oid::POINT_ARRAY,
            GeometricKind::LSeg => oid::LSEG_ARRAY,
            GeometricKind::Box => oid::BOX_ARRAY,
            GeometricKind::Circle => oid::CIRCLE_ARRAY,
        }
    }

    /// Number of float8 coordinates on the wire.
    fn coords(self) -> usize {
        match self {
            GeometricKind::Point => 2,
            GeometricKind::LSeg | GeometricKind::Box => 4,
            GeometricKind::Circle => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometricHandler {
    kind: GeometricKind,
}

impl GeometricHandler {
    pub fn new(kind: GeometricKind) -> Self {
        Self { kind }
    }

    fn to_coords(&self, value: &Value) -> Result<Vec<f64>> {
        Ok(match (self.kind, value) {
            (GeometricKind::Point, Value::Point(p)) => vec![p.x, p.y],
            (GeometricKind::LSeg, Value::LSeg(s)) => vec![s.start.x, s.start.y, s.end.x, s.end.y],
            (GeometricKind::Box, Value::Box(b)) => vec![b.high.x, b.high.y, b.low.x, b.low.y],
            (GeometricKind::Circle, Value::Circle(c)) => vec![c.center.x, c.center.y, c.radius],
            (kind, value) => return Err(Error::type_mismatch(kind.name(), value.kind_name())),
        })
    }

    fn from_coords(&self, c: &[f64]) -> Value {
        match self.kind {
            GeometricKind::Point => Value::Point(Point::new(c[0], c[1])),
            GeometricKind::LSeg => {
                Value::LSeg(LSeg::new(Point::new(c[0], c[1]), Point::new(c[2], c[3])))
            }
            GeometricKind::Box => {
                Value::Box(PgBox::new(Point::new(c[0], c[1]), Point::new(c[2], c[3])))
            }
            GeometricKind::Circle => Value::Circle(Circle::new(Point::new(c[0], c[1]), c[2])),
        }
    }
}

impl TypeHandler for GeometricHandler {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn oid(&self) -> Oid {
        self.kind.oid()
    }

    /// Box literals contain commas, so box arrays are delimited by `;`.
    fn delimiter(&self) -> u8 {
        match self.kind {
            GeometricKind::Box => b';',
            _ => b',',
        }
    }

    fn validate_and_len(&self, value: &Value) -> Result<usize> {
        self.to_coords(value).map(|c| c.len() * 8)
    }

    fn write(&self, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        for coord in self.to_coords(value)? {
            buf.extend_from_slice(&coord.to_be_bytes());
        }
        Ok(())
    }

    fn read_binary(&self, cursor: &mut FieldCursor<'_>) -> Result<Value> {
        let mut coords = [0f64; 4];
        for slot in coords.iter_mut().take(self.kind.coords()) {
            *slot = cursor.read_f64()?;
        }
        Ok(self.from_coords(&coords))
    }

    /// Accepts the server output forms `(x,y)`, `[(x1,y1),(x2,y2)]`,
    /// `(x1,y1),(x2,y2)` and `<(x,y),r>`.
    fn read_text(&self, text: &str) -> Result<Value> {
        let coords = text
            .split(|c: char| matches!(c, '(' | ')' | '[' | ']' | '<' | '>' | ','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(super::scalar::parse_float)
            .collect::<Result<Vec<f64>>>()?;
        if coords.len() != self.kind.coords() {
            return Err(Error::Decode(format!(
                "invalid {} literal: {:?}",
                self.kind.name(),
                text
            )));
        }
        Ok(self.from_coords(&coords))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_len(kind: GeometricKind, value: &Value) -> usize {
        GeometricHandler::new(kind).validate_and_len(value).unwrap()
    }

    #[test]
    fn test_wire_sizes() {
        let p = Point::new(1.0, 2.0);
        assert_eq!(wire_len(GeometricKind::Point, &Value::Point(p)), 16);
        assert_eq!(wire_len(GeometricKind::LSeg, &Value::LSeg(LSeg::new(p, p))), 32);
        assert_eq!(wire_len(GeometricKind::Box, &Value::Box(PgBox::new(p, p))), 32);
        assert_eq!(wire_len(GeometricKind::Circle, &Value::Circle(Circle::new(p, 3.0))), 24);
    }

    #[test]
    fn test_binary_roundtrip() {
        let handler = GeometricHandler::new(GeometricKind::Circle);
        let value = Value::Circle(Circle::new(Point::new(-1.5, 2.0), 0.5));
        let mut buf = Vec::new();
        handler.write(&value, &mut buf).unwrap();
        let mut cursor = FieldCursor::new(&buf);
        assert_eq!(handler.read_binary(&mut cursor).unwrap(), value);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_text_forms() {
        let point = GeometricHandler::new(GeometricKind::Point);
        assert_eq!(point.read_text("(1.5,-2)").unwrap(), Value::Point(Point::new(1.5, -2.0)));

        let lseg = GeometricHandler::new(GeometricKind::LSeg);
        assert_eq!(
            lseg.read_text("[(0,0),(1,1)]").unwrap(),
            Value::LSeg(LSeg::new(Point::new(0.0, 0.0), Point::new(1.0, 1.0)))
        );

        let bx = GeometricHandler::new(GeometricKind::Box);
        assert_eq!(
            bx.read_text("(3,4),(1,2)").unwrap(),
            Value::Box(PgBox::new(Point::new(1.0, 2.0), Point::new(3.0, 4.0)))
        );

        let circle = GeometricHandler::new(GeometricKind::Circle);
        assert_eq!(
            circle.read_text("<(0,0),2>").unwrap(),
            Value::Circle(Circle::new(Point::new(0.0, 0.0), 2.0))
        );
        assert!(circle.read_text("(0,0)").is_err());
    }

    #[test]
    fn test_mismatch() {
        let handler = GeometricHandler::new(GeometricKind::Point);
        assert!(matches!(
            handler.validate_and_len(&Value::Float8(1.0)),
            Err(Error::Encode(_))
        ));
    }
}
