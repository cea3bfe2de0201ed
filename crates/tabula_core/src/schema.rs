//! Table schemas.

use crate::error::{CoreError, CoreResult};
use crate::value::{ColumnType, Value};
use serde::{Deserialize, Serialize};

/// Definition of a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name, unique within the table.
    pub name: String,
    /// Declared type.
    pub column_type: ColumnType,
    /// Whether NULL is rejected.
    pub not_null: bool,
    /// Whether the column has an ordered index.
    pub indexed: bool,
}

impl ColumnDef {
    /// Creates a nullable, unindexed column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            not_null: false,
            indexed: false,
        }
    }

    /// Marks the column NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Gives the column an ordered index.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
}

/// Schema of a table: its name and ordered columns.
///
/// Index number 0 of a table's index set is always the list of visible
/// rows. Every indexed column owns the next index number, in column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns in storage order.
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Creates an empty schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Appends a column.
    #[must_use]
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Number of columns.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Position of the column named `name`.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Position of the column named `name`, or an error naming the table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the column doesn't exist.
    pub fn require_column(&self, name: &str) -> CoreResult<usize> {
        self.column_index(name).ok_or_else(|| {
            CoreError::invalid_operation(format!("no column {name} in table {}", self.name))
        })
    }

    /// Definition of the column at `column`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the position is out of range.
    pub fn require_column_at(&self, column: usize) -> CoreResult<&ColumnDef> {
        self.columns.get(column).ok_or_else(|| {
            CoreError::invalid_operation(format!(
                "column {column} out of range for table {} ({} columns)",
                self.name,
                self.columns.len()
            ))
        })
    }

    /// Index number of the list ordering `column`, if it is indexed.
    #[must_use]
    pub fn index_number(&self, column: usize) -> Option<usize> {
        let def = self.columns.get(column)?;
        if !def.indexed {
            return None;
        }
        Some(1 + self.columns[..column].iter().filter(|c| c.indexed).count())
    }

    /// Indexed columns with their index numbers.
    pub fn indexed_columns(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.indexed)
            .enumerate()
            .map(|(rank, (column, _))| (column, rank + 1))
    }

    /// Total number of index lists the table needs.
    #[must_use]
    pub fn index_count(&self) -> usize {
        1 + self.columns.iter().filter(|c| c.indexed).count()
    }

    /// Checks column names are unique and non-empty.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` describing the first problem.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::invalid_operation("table name is empty"));
        }
        if self.columns.is_empty() {
            return Err(CoreError::invalid_operation(format!(
                "table {} has no columns",
                self.name
            )));
        }
        for (i, col) in self.columns.iter().enumerate() {
            if col.name.is_empty() {
                return Err(CoreError::invalid_operation(format!(
                    "column {i} of {} has no name",
                    self.name
                )));
            }
            if self.columns[..i].iter().any(|c| c.name == col.name) {
                return Err(CoreError::invalid_operation(format!(
                    "duplicate column {} in {}",
                    col.name, self.name
                )));
            }
        }
        Ok(())
    }

    /// Checks a row against arity, column types and NOT NULL.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for arity or type mismatches and
    /// `ConstraintViolation` for NULL in a NOT NULL column.
    pub fn validate_row(&self, values: &[Value]) -> CoreResult<()> {
        if values.len() != self.columns.len() {
            return Err(CoreError::invalid_operation(format!(
                "table {} has {} columns, row has {}",
                self.name,
                self.columns.len(),
                values.len()
            )));
        }
        for (col, value) in self.columns.iter().zip(values) {
            if value.is_null() {
                if col.not_null {
                    return Err(CoreError::constraint_violation(
                        format!("{}_not_null", col.name),
                        &self.name,
                        format!("column {} is NOT NULL", col.name),
                    ));
                }
            } else if !value.fits(col.column_type) {
                return Err(CoreError::invalid_operation(format!(
                    "column {}.{} expects {}, got {value}",
                    self.name, col.name, col.column_type
                )));
            }
        }
        Ok(())
    }

    /// Encodes the schema as CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if encoding fails.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes a schema written by [`TableSchema::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes are not a schema.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> TableSchema {
        TableSchema::new("people")
            .column(ColumnDef::new("id", ColumnType::Integer).not_null().indexed())
            .column(ColumnDef::new("name", ColumnType::Text))
            .column(ColumnDef::new("email", ColumnType::Text).indexed())
    }

    #[test]
    fn index_numbers_follow_indexed_columns() {
        let schema = people();
        assert_eq!(schema.index_number(0), Some(1));
        assert_eq!(schema.index_number(1), None);
        assert_eq!(schema.index_number(2), Some(2));
        assert_eq!(schema.index_count(), 3);
        assert_eq!(
            schema.indexed_columns().collect::<Vec<_>>(),
            vec![(0, 1), (2, 2)]
        );
    }

    #[test]
    fn validate_row_checks() {
        let schema = people();
        assert!(schema
            .validate_row(&[Value::Integer(1), Value::Null, "a@b".into()])
            .is_ok());

        let err = schema
            .validate_row(&[Value::Null, Value::Null, Value::Null])
            .unwrap_err();
        assert!(err.is_constraint_violation());

        assert!(schema.validate_row(&[Value::Integer(1)]).is_err());
        assert!(schema
            .validate_row(&["x".into(), Value::Null, Value::Null])
            .is_err());
    }

    #[test]
    fn duplicate_columns_rejected() {
        let schema = TableSchema::new("t")
            .column(ColumnDef::new("a", ColumnType::Integer))
            .column(ColumnDef::new("a", ColumnType::Text));
        assert!(schema.validate().is_err());
        assert!(TableSchema::new("t").validate().is_err());
    }

    #[test]
    fn schema_cbor_roundtrip() {
        let schema = people();
        let decoded = TableSchema::from_bytes(&schema.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, schema);
    }
}
