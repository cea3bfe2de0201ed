//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use proptest::prelude::*;
use tabula_core::{ColumnDef, ColumnType, TableSchema, Value};

/// Strategy for generating valid table names.
pub fn table_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating a non-null value of `ty`.
///
/// Blob columns get no strategy of their own: blob references must come
/// from a blob store, so they are generated as `Null`.
pub fn value_strategy(ty: ColumnType) -> BoxedStrategy<Value> {
    match ty {
        ColumnType::Boolean => any::<bool>().prop_map(Value::Boolean).boxed(),
        ColumnType::Integer => any::<i64>().prop_map(Value::Integer).boxed(),
        ColumnType::Text => prop::string::string_regex("[a-zA-Z0-9 ]{0,24}")
            .expect("Invalid regex")
            .prop_map(Value::Text)
            .boxed(),
        ColumnType::Binary => prop::collection::vec(any::<u8>(), 0..64)
            .prop_map(Value::Binary)
            .boxed(),
        ColumnType::Blob => Just(Value::Null).boxed(),
    }
}

/// Strategy for a value of `column`, including `Null` when the column
/// allows it.
pub fn cell_strategy(column: &ColumnDef) -> BoxedStrategy<Value> {
    if column.not_null {
        value_strategy(column.column_type)
    } else {
        prop_oneof![1 => Just(Value::Null), 4 => value_strategy(column.column_type)].boxed()
    }
}

/// Strategy for a row matching `schema`.
pub fn row_strategy(schema: &TableSchema) -> BoxedStrategy<Vec<Value>> {
    schema
        .columns
        .iter()
        .map(cell_strategy)
        .collect::<Vec<_>>()
        .boxed()
}

/// Strategy for a column type other than blob.
pub fn column_type_strategy() -> impl Strategy<Value = ColumnType> {
    prop_oneof![
        Just(ColumnType::Boolean),
        Just(ColumnType::Integer),
        Just(ColumnType::Text),
        Just(ColumnType::Binary),
    ]
}

/// Strategy for a valid table schema with 1 to 6 columns.
pub fn schema_strategy() -> impl Strategy<Value = TableSchema> {
    (
        table_name_strategy(),
        prop::collection::vec((column_type_strategy(), any::<bool>(), any::<bool>()), 1..6),
    )
        .prop_map(|(name, columns)| {
            columns
                .into_iter()
                .enumerate()
                .fold(TableSchema::new(name), |schema, (i, (ty, not_null, indexed))| {
                    let mut column = ColumnDef::new(format!("c{i}"), ty);
                    column.not_null = not_null;
                    column.indexed = indexed;
                    schema.column(column)
                })
        })
}

/// One step of a random workload against the `items` table.
///
/// Row positions index into the rows live at the time the step runs,
/// modulo their count, so every sequence is applicable.
#[derive(Debug, Clone)]
pub enum TableOperation {
    /// Insert an item.
    Insert {
        /// Item id.
        id: i64,
        /// Item name.
        name: String,
    },
    /// Update a live item's name.
    Update {
        /// Position among live rows.
        position: usize,
        /// New name.
        name: String,
    },
    /// Delete a live item.
    Delete {
        /// Position among live rows.
        position: usize,
    },
    /// Commit the open transaction and start a new one.
    Commit,
    /// Roll back the open transaction and start a new one.
    Rollback,
}

/// Strategy for generating table operations.
pub fn table_operation_strategy() -> impl Strategy<Value = TableOperation> {
    let name = || prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex");
    prop_oneof![
        4 => (0i64..64, name()).prop_map(|(id, name)| TableOperation::Insert { id, name }),
        2 => (any::<usize>(), name()).prop_map(|(position, name)| TableOperation::Update { position, name }),
        2 => any::<usize>().prop_map(|position| TableOperation::Delete { position }),
        1 => Just(TableOperation::Commit),
        1 => Just(TableOperation::Rollback),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<TableOperation>> {
    prop::collection::vec(table_operation_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn generated_schemas_are_valid(schema in schema_strategy()) {
            prop_assert!(schema.validate().is_ok());
        }

        #[test]
        fn generated_rows_fit_their_schema(
            (schema, row) in schema_strategy().prop_flat_map(|s| {
                let rows = row_strategy(&s);
                (Just(s), rows)
            })
        ) {
            prop_assert!(schema.validate_row(&row).is_ok());
        }
    }
}
