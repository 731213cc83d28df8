//! Result rows and column metadata.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::backend::{DataRow, FieldDescription};
use crate::protocol::types::{FormatCode, Oid};
use crate::types::{FromValue, TypeRegistry, Value};

/// Column metadata from a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
    table_oid: Oid,
    column_id: i16,
    type_oid: Oid,
    type_modifier: i32,
    format: FormatCode,
}

impl Column {
    /// `format` is the one requested for the result, which a statement
    /// Describe reports as text before any format is chosen.
    pub(crate) fn from_field(field: &FieldDescription<'_>, format: FormatCode) -> Self {
        Self {
            name: field.name.to_string(),
            table_oid: field.table_oid(),
            column_id: field.column_id(),
            type_oid: field.type_oid(),
            type_modifier: field.type_modifier(),
            format,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OID of the source table, or 0
    pub fn table_oid(&self) -> Oid {
        self.table_oid
    }

    /// Attribute number in the source table, or 0
    pub fn column_id(&self) -> i16 {
        self.column_id
    }

    pub fn type_oid(&self) -> Oid {
        self.type_oid
    }

    pub fn type_modifier(&self) -> i32 {
        self.type_modifier
    }

    pub fn format(&self) -> FormatCode {
        self.format
    }
}

/// One decoded result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn decode(
        columns: &Arc<[Column]>,
        data: &DataRow<'_>,
        registry: &TypeRegistry,
    ) -> Result<Self> {
        if data.len() != columns.len() {
            return Err(Error::Protocol(format!(
                "DataRow has {} columns, RowDescription declared {}",
                data.len(),
                columns.len()
            )));
        }
        let values = columns
            .iter()
            .zip(data.iter())
            .map(|(column, raw)| registry.decode(column.type_oid, column.format, raw))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            columns: Arc::clone(columns),
            values,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Typed access by column index.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.values.get(index).ok_or_else(|| {
            Error::InvalidUsage(format!(
                "column index {} out of range for {} columns",
                index,
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Typed access by column name. The first column with that name wins.
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::InvalidUsage(format!("no column named {:?}", name)))?;
        self.get(index)
    }

    /// Decode the whole row into a tuple.
    pub fn decode_as<T: FromRow>(&self) -> Result<T> {
        T::from_row(self)
    }
}

/// Conversion of a whole row, implemented for tuples of [`FromValue`] types.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

macro_rules! impl_from_row_tuple {
    ($len:expr => $($name:ident: $idx:tt),+) => {
        impl<$($name: FromValue),+> FromRow for ($($name,)+) {
            fn from_row(row: &Row) -> Result<Self> {
                if row.len() < $len {
                    return Err(Error::Decode(format!(
                        "row has {} columns, tuple needs {}",
                        row.len(),
                        $len
                    )));
                }
                Ok(($(row.get::<$name>($idx)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(1 => T1: 0);
impl_from_row_tuple!(2 => T1: 0, T2: 1);
impl_from_row_tuple!(3 => T1: 0, T2: 1, T3: 2);
impl_from_row_tuple!(4 => T1: 0, T2: 1, T3: 2, T4: 3);
impl_from_row_tuple!(5 => T1: 0, T2: 1, T3: 2, T4: 3, T5: 4);
impl_from_row_tuple!(6 => T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5);
impl_from_row_tuple!(7 => T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6);
impl_from_row_tuple!(8 => T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7);

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::backend::RowDescription;
    use crate::protocol::types::oid;

    fn row_description(fields: &[(&str, Oid)]) -> Vec<u8> {
        let mut payload = (fields.len() as i16).to_be_bytes().to_vec();
        for (name, type_oid) in fields {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&0u32.to_be_bytes());
            payload.extend_from_slice(&0i16.to_be_bytes());
            payload.extend_from_slice(&type_oid.to_be_bytes());
            payload.extend_from_slice(&(-1i16).to_be_bytes());
            payload.extend_from_slice(&(-1i32).to_be_bytes());
            payload.extend_from_slice(&1u16.to_be_bytes());
        }
        payload
    }

    fn data_row(values: &[Option<&[u8]>]) -> Vec<u8> {
        let mut payload = (values.len() as i16).to_be_bytes().to_vec();
        for value in values {
            match value {
                Some(bytes) => {
                    payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    payload.extend_from_slice(bytes);
                }
                None => payload.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        payload
    }

    fn columns(payload: &[u8]) -> Arc<[Column]> {
        let description = RowDescription::parse(payload).unwrap();
        description
            .fields()
            .iter()
            .map(|f| Column::from_field(f, FormatCode::Binary))
            .collect()
    }

    #[test]
    fn test_decode_and_access() {
        let columns = columns(&row_description(&[("id", oid::INT4), ("name", oid::TEXT)]));
        let payload = data_row(&[Some(&7i32.to_be_bytes()), None]);
        let data = DataRow::parse(&payload).unwrap();
        let row = Row::decode(&columns, &data, &TypeRegistry::builtin()).unwrap();

        assert_eq!(row.get::<i32>(0).unwrap(), 7);
        assert_eq!(row.get_by_name::<Option<String>>("name").unwrap(), None);
        assert!(row.get::<i32>(5).is_err());
        assert!(row.get_by_name::<i32>("missing").is_err());

        let (id, name): (i64, Option<String>) = row.decode_as().unwrap();
        assert_eq!((id, name), (7, None));
        assert!(row.decode_as::<(i32, Option<String>, i32)>().is_err());
    }

    #[test]
    fn test_column_count_mismatch() {
        let columns = columns(&row_description(&[("a", oid::INT4)]));
        let payload = data_row(&[None, None]);
        let data = DataRow::parse(&payload).unwrap();
        assert!(matches!(
            Row::decode(&columns, &data, &TypeRegistry::builtin()),
            Err(Error::Protocol(_))
        ));
    }
}
