//! Array handler over any element handler.
//!
//! Binary layout: ndim, has-null flag, element OID, then (length, lower bound)
//! per dimension, then each element as a length-prefixed field (-1 for NULL).

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::types::Oid;

use super::cursor::FieldCursor;
use super::value::{ArrayDim, ArrayValue, Value};
use super::{Handler, TypeHandler, read_field};

/// Same limit as the server.
const MAX_DIMS: usize = 6;

#[derive(Debug, Clone)]
pub struct ArrayHandler {
    name: String,
    oid: Oid,
    element: Arc<Handler>,
}

impl ArrayHandler {
    pub fn new(oid: Oid, element: Arc<Handler>) -> Self {
        Self {
            name: format!("_{}", element.name()),
            oid,
            element,
        }
    }

    pub fn element(&self) -> &Arc<Handler> {
        &self.element
    }

    fn array<'v>(&self, value: &'v Value) -> Result<&'v ArrayValue> {
        match value {
            Value::Array(array) if array.dims().len() <= MAX_DIMS => Ok(array),
            Value::Array(array) => Err(Error::Encode(format!(
                "array has {} dimensions, at most {} are supported",
                array.dims().len(),
                MAX_DIMS
            ))),
            other => Err(Error::type_mismatch(&self.name, other.kind_name())),
        }
    }
}

impl TypeHandler for ArrayHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn oid(&self) -> Oid {
        self.oid
    }

    fn validate_and_len(&self, value: &Value) -> Result<usize> {
        let array = self.array(value)?;
        let mut len = 12 + 8 * array.dims().len();
        for element in array.elements() {
            len += 4;
            if !element.is_null() {
                len += self.element.validate_and_len(element)?;
            }
        }
        Ok(len)
    }

    fn write(&self, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        let array = self.array(value)?;
        let has_nulls = array.elements().iter().any(Value::is_null);
        buf.extend_from_slice(&(array.dims().len() as i32).to_be_bytes());
        buf.extend_from_slice(&(has_nulls as i32).to_be_bytes());
        buf.extend_from_slice(&self.element.oid().to_be_bytes());
        for dim in array.dims() {
            buf.extend_from_slice(&dim.len.to_be_bytes());
            buf.extend_from_slice(&dim.lower_bound.to_be_bytes());
        }
        for element in array.elements() {
            if element.is_null() {
                buf.extend_from_slice(&(-1_i32).to_be_bytes());
                continue;
            }
            let len_pos = buf.len();
            buf.extend_from_slice(&[0; 4]);
            self.element.write(element, buf)?;
            let len = (buf.len() - len_pos - 4) as i32;
            buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
        }
        Ok(())
    }

    fn read_binary(&self, cursor: &mut FieldCursor<'_>) -> Result<Value> {
        let ndim = cursor.read_i32()?;
        let ndim = usize::try_from(ndim)
            .ok()
            .filter(|&n| n <= MAX_DIMS)
            .ok_or_else(|| Error::Decode(format!("invalid array dimension count {}", ndim)))?;
        let flags = cursor.read_i32()?;
        if flags != 0 && flags != 1 {
            return Err(Error::Decode(format!("invalid array flags {}", flags)));
        }
        let element_oid = cursor.read_u32()?;
        if element_oid != self.element.oid() {
            return Err(Error::Decode(format!(
                "{} array carries element oid {}, expected {}",
                self.name,
                element_oid,
                self.element.oid()
            )));
        }

        let mut dims = Vec::with_capacity(ndim);
        let mut count = if ndim == 0 { 0usize } else { 1usize };
        for _ in 0..ndim {
            let len = cursor.read_i32()?;
            let lower_bound = cursor.read_i32()?;
            count = usize::try_from(len)
                .ok()
                .and_then(|len| count.checked_mul(len))
                .ok_or_else(|| Error::Decode(format!("invalid array dimension length {}", len)))?;
            dims.push(ArrayDim { len, lower_bound });
        }
        // Every element needs at least its length prefix.
        if count > cursor.remaining() / 4 {
            return Err(Error::Decode(format!(
                "array declares {} elements but only {} bytes remain",
                count,
                cursor.remaining()
            )));
        }

        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            let len = cursor.read_i32()?;
            if len == -1 {
                elements.push(Value::Null);
                continue;
            }
            let len = usize::try_from(len)
                .map_err(|_| Error::Decode(format!("invalid array element length {}", len)))?;
            let field = cursor.read_bytes(len)?;
            elements.push(read_field(&self.element, field)?);
        }
        Ok(Value::Array(ArrayValue::from_parts(dims, elements)))
    }

    fn read_text(&self, text: &str) -> Result<Value> {
        let parsed = TextArrayParser::new(text, self.element.delimiter()).parse()?;
        let elements = parsed
            .leaves
            .into_iter()
            .map(|leaf| match leaf {
                None => Ok(Value::Null),
                Some(s) => self.element.read_text(&s),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Array(ArrayValue::from_parts(parsed.dims, elements)))
    }
}

#[derive(Debug)]
enum Node {
    Leaf(Option<String>),
    List(Vec<Node>),
}

#[derive(Debug)]
struct ParsedArray {
    dims: Vec<ArrayDim>,
    leaves: Vec<Option<String>>,
}

/// Parser for the array output format, e.g. `{1,NULL,"a \"b\""}` or
/// `[0:1][1:2]={{1,2},{3,4}}`.
struct TextArrayParser<'a> {
    s: &'a [u8],
    pos: usize,
    delim: u8,
}

impl<'a> TextArrayParser<'a> {
    fn new(text: &'a str, delim: u8) -> Self {
        Self {
            s: text.as_bytes(),
            pos: 0,
            delim,
        }
    }

    fn error(&self, what: &str) -> Error {
        Error::Decode(format!(
            "malformed array literal at offset {}: {}",
            self.pos, what
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, b: u8) -> Result<()> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", b as char)))
        }
    }

    fn parse(mut self) -> Result<ParsedArray> {
        self.skip_ws();
        let bounds = if self.peek() == Some(b'[') {
            self.parse_bounds()?
        } else {
            Vec::new()
        };
        self.skip_ws();
        self.expect(b'{')?;
        let root = self.parse_list()?;
        self.skip_ws();
        if self.pos != self.s.len() {
            return Err(self.error("trailing characters"));
        }

        let mut lens = Vec::new();
        let mut node = &root;
        while let Node::List(items) = node {
            lens.push(items.len());
            match items.first() {
                Some(first) => node = first,
                None => break,
            }
        }
        if lens == [0] {
            lens.clear();
        }

        let mut leaves = Vec::new();
        if !lens.is_empty() {
            flatten(root, &lens, 0, &mut leaves)
                .map_err(|what| Error::Decode(format!("malformed array literal: {}", what)))?;
        }

        let dims = if bounds.is_empty() {
            lens.iter()
                .map(|&len| ArrayDim {
                    len: len as i32,
                    lower_bound: 1,
                })
                .collect()
        } else {
            if bounds.len() != lens.len() {
                return Err(Error::Decode(
                    "array bounds disagree with nesting depth".into(),
                ));
            }
            bounds
                .iter()
                .zip(&lens)
                .map(|(&(lb, ub), &len)| {
                    if ub as i64 - lb as i64 + 1 != len as i64 {
                        return Err(Error::Decode(format!(
                            "array bounds [{}:{}] disagree with {} elements",
                            lb, ub, len
                        )));
                    }
                    Ok(ArrayDim {
                        len: len as i32,
                        lower_bound: lb,
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        Ok(ParsedArray { dims, leaves })
    }

    fn parse_bounds(&mut self) -> Result<Vec<(i32, i32)>> {
        let mut bounds = Vec::new();
        while self.peek() == Some(b'[') {
            self.pos += 1;
            let lb = self.parse_int()?;
            self.expect(b':')?;
            let ub = self.parse_int()?;
            self.expect(b']')?;
            bounds.push((lb, ub));
        }
        self.expect(b'=')?;
        Ok(bounds)
    }

    fn parse_int(&mut self) -> Result<i32> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.s[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.error("invalid bound"))
    }

    /// Called after the opening brace.
    fn parse_list(&mut self) -> Result<Node> {
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Node::List(items));
        }
        loop {
            self.skip_ws();
            if self.peek() == Some(b'{') {
                self.pos += 1;
                items.push(self.parse_list()?);
            } else {
                items.push(Node::Leaf(self.parse_element()?));
            }
            self.skip_ws();
            match self.peek() {
                Some(b) if b == self.delim => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Node::List(items));
                }
                _ => return Err(self.error("expected delimiter or '}'")),
            }
        }
    }

    fn parse_element(&mut self) -> Result<Option<String>> {
        let mut out = Vec::new();
        if self.peek() == Some(b'"') {
            self.pos += 1;
            loop {
                match self.peek() {
                    None => return Err(self.error("unterminated quoted element")),
                    Some(b'"') => {
                        self.pos += 1;
                        break;
                    }
                    Some(b'\\') => {
                        let escaped = self
                            .s
                            .get(self.pos + 1)
                            .copied()
                            .ok_or_else(|| self.error("dangling escape"))?;
                        out.push(escaped);
                        self.pos += 2;
                    }
                    Some(b) => {
                        out.push(b);
                        self.pos += 1;
                    }
                }
            }
            return String::from_utf8(out)
                .map(Some)
                .map_err(|e| Error::Decode(format!("invalid UTF-8: {}", e)));
        }

        let mut escaped_any = false;
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated array")),
                Some(b) if b == self.delim || b == b'}' => break,
                Some(b'{') | Some(b'"') => return Err(self.error("unexpected character")),
                Some(b'\\') => {
                    let escaped = self
                        .s
                        .get(self.pos + 1)
                        .copied()
                        .ok_or_else(|| self.error("dangling escape"))?;
                    out.push(escaped);
                    escaped_any = true;
                    self.pos += 2;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
        while out.last().is_some_and(|b| b.is_ascii_whitespace()) {
            out.pop();
        }
        if out.is_empty() {
            return Err(self.error("empty element"));
        }
        if !escaped_any && out.eq_ignore_ascii_case(b"NULL") {
            return Ok(None);
        }
        String::from_utf8(out)
            .map(Some)
            .map_err(|e| Error::Decode(format!("invalid UTF-8: {}", e)))
    }
}

fn flatten(
    node: Node,
    lens: &[usize],
    depth: usize,
    out: &mut Vec<Option<String>>,
) -> core::result::Result<(), &'static str> {
    let Node::List(items) = node else {
        return Err("element where a sub-array was expected");
    };
    if items.len() != lens[depth] {
        return Err("sub-arrays have different lengths");
    }
    let innermost = depth + 1 == lens.len();
    for item in items {
        match (item, innermost) {
            (Node::Leaf(leaf), true) => out.push(leaf),
            (list @ Node::List(_), false) => flatten(list, lens, depth + 1, out)?,
            (Node::List(_), true) => return Err("sub-array where an element was expected"),
            (Node::Leaf(_), false) => return Err("element where a sub-array was expected"),
        }
    }
    Ok(())
}
