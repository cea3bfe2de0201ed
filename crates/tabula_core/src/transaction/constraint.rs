//! Table constraints and their checks.
//!
//! Constraints are checked against row changes: rows a transaction added
//! and rows it removed. Immediate constraints are checked right after each
//! operation against the transaction's own views; deferred ones at commit
//! against the check transaction, which shows the database as it will be
//! once the commit lands.

use crate::error::{CoreError, CoreResult};
use crate::schema::TableSchema;
use crate::types::RowId;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// When a constraint is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deferrability {
    /// After every operation.
    #[default]
    Immediate,
    /// At commit.
    Deferred,
}

/// Cell lookup by column name, handed to check expressions.
pub trait RowResolver {
    /// Value of `column` in the row being checked.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no such column.
    fn resolve(&self, column: &str) -> CoreResult<Value>;
}

/// A boolean expression over one row, evaluated by the expression engine.
pub trait CheckExpression: Send + Sync + fmt::Debug {
    /// Evaluates the expression. `Boolean(false)` fails the check, `Null`
    /// and `Boolean(true)` pass it.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression cannot be evaluated.
    fn evaluate(&self, row: &dyn RowResolver) -> CoreResult<Value>;
}

/// What a constraint enforces.
#[derive(Debug, Clone)]
pub enum ConstraintKind {
    /// No two rows share the same non-null values.
    Unique,
    /// Unique and never null.
    PrimaryKey,
    /// Non-null values must exist in `ref_columns` of `ref_table`.
    ForeignKey {
        /// Referenced table.
        ref_table: String,
        /// Referenced columns, matched positionally.
        ref_columns: Vec<String>,
    },
    /// `expression` must not evaluate to false.
    Check {
        /// The expression.
        expression: Arc<dyn CheckExpression>,
    },
}

/// A named constraint on one table.
#[derive(Debug, Clone)]
pub struct Constraint {
    /// Constraint name, unique in the database.
    pub name: String,
    /// Constrained table.
    pub table: String,
    /// Constrained columns.
    pub columns: Vec<String>,
    /// What it enforces.
    pub kind: ConstraintKind,
    /// When it is checked.
    pub deferrability: Deferrability,
}

fn owned(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| (*c).to_owned()).collect()
}

impl Constraint {
    /// A unique constraint.
    pub fn unique(name: impl Into<String>, table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: owned(columns),
            kind: ConstraintKind::Unique,
            deferrability: Deferrability::Immediate,
        }
    }

    /// A primary key.
    pub fn primary_key(name: impl Into<String>, table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            kind: ConstraintKind::PrimaryKey,
            ..Self::unique(name, table, columns)
        }
    }

    /// A foreign key from `columns` of `table` to `ref_columns` of
    /// `ref_table`.
    pub fn foreign_key(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: &[&str],
        ref_table: impl Into<String>,
        ref_columns: &[&str],
    ) -> Self {
        Self {
            kind: ConstraintKind::ForeignKey {
                ref_table: ref_table.into(),
                ref_columns: owned(ref_columns),
            },
            ..Self::unique(name, table, columns)
        }
    }

    /// A check constraint.
    pub fn check(
        name: impl Into<String>,
        table: impl Into<String>,
        expression: Arc<dyn CheckExpression>,
    ) -> Self {
        Self {
            kind: ConstraintKind::Check { expression },
            ..Self::unique(name, table, &[])
        }
    }

    /// Checks the constraint at commit instead of after each operation.
    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.deferrability = Deferrability::Deferred;
        self
    }

    /// Whether the constraint is checked at commit.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.deferrability == Deferrability::Deferred
    }

    /// Table this constraint references, for foreign keys.
    #[must_use]
    pub fn referenced_table(&self) -> Option<&str> {
        match &self.kind {
            ConstraintKind::ForeignKey { ref_table, .. } => Some(ref_table),
            _ => None,
        }
    }

    fn violation(&self, message: impl Into<String>) -> CoreError {
        CoreError::constraint_violation(&self.name, &self.table, message)
    }
}

/// The set of constraints in force.
#[derive(Debug, Clone, Default)]
pub struct ConstraintRegistry {
    constraints: Vec<Constraint>,
}

impl ConstraintRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a constraint.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the name is taken.
    pub fn add(&mut self, constraint: Constraint) -> CoreResult<()> {
        if self.get(&constraint.name).is_some() {
            return Err(CoreError::invalid_operation(format!(
                "constraint {} already exists",
                constraint.name
            )));
        }
        self.constraints.push(constraint);
        Ok(())
    }

    /// Removes and returns the constraint called `name`.
    pub fn remove(&mut self, name: &str) -> Option<Constraint> {
        let pos = self.constraints.iter().position(|c| c.name == name)?;
        Some(self.constraints.remove(pos))
    }

    /// Removes every constraint on `table`.
    pub fn remove_table(&mut self, table: &str) {
        self.constraints.retain(|c| c.table != table);
    }

    /// The constraint called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.name == name)
    }

    /// Constraints on `table`.
    pub fn on_table<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Constraint> + 'a {
        self.constraints.iter().filter(move |c| c.table == table)
    }

    /// Foreign keys referencing `table` from another table.
    pub fn referencing<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Constraint> + 'a {
        self.constraints
            .iter()
            .filter(move |c| c.table != table && c.referenced_table() == Some(table))
    }

    /// Every constraint.
    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter()
    }

    /// Number of constraints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    /// Whether there are no constraints.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

/// Read access to tables for constraint checks.
pub(crate) trait ConstraintLookup {
    /// Schema of `table`.
    fn schema(&self, table: &str) -> CoreResult<Arc<TableSchema>>;

    /// Rows of `table` whose cells on `columns` equal `values`.
    fn rows_matching(&mut self, table: &str, columns: &[usize], values: &[Value]) -> CoreResult<Vec<RowId>>;

    /// Cell of a row of `table`, visible or not.
    fn read_cell(&mut self, table: &str, row: RowId, column: usize) -> CoreResult<Value>;
}

/// Cells of one row, resolved by column name.
pub struct RowValues<'a> {
    schema: &'a TableSchema,
    values: Vec<Value>,
}

impl<'a> RowValues<'a> {
    /// Wraps the cells of a row of `schema`.
    #[must_use]
    pub fn new(schema: &'a TableSchema, values: Vec<Value>) -> Self {
        Self { schema, values }
    }
}

impl RowResolver for RowValues<'_> {
    fn resolve(&self, column: &str) -> CoreResult<Value> {
        let index = self.schema.require_column(column)?;
        Ok(self.values.get(index).cloned().unwrap_or(Value::Null))
    }
}

fn column_positions(schema: &TableSchema, columns: &[String]) -> CoreResult<Vec<usize>> {
    columns.iter().map(|c| schema.require_column(c)).collect()
}

fn read_cells(
    lookup: &mut dyn ConstraintLookup,
    table: &str,
    row: RowId,
    columns: &[usize],
) -> CoreResult<Vec<Value>> {
    columns
        .iter()
        .map(|c| lookup.read_cell(table, row, *c))
        .collect()
}

/// Checks `constraints` of `table` against rows added to it.
pub(crate) fn check_added(
    lookup: &mut dyn ConstraintLookup,
    constraints: &[&Constraint],
    table: &str,
    rows: &[RowId],
) -> CoreResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let schema = lookup.schema(table)?;
    for constraint in constraints.iter().filter(|c| c.table == table) {
        let columns = column_positions(&schema, &constraint.columns)?;
        match &constraint.kind {
            ConstraintKind::Unique | ConstraintKind::PrimaryKey => {
                let primary = matches!(constraint.kind, ConstraintKind::PrimaryKey);
                for row in rows {
                    let values = read_cells(lookup, table, *row, &columns)?;
                    if values.iter().any(Value::is_null) {
                        if primary {
                            return Err(constraint.violation(format!("{row} has a null key")));
                        }
                        continue;
                    }
                    if lookup.rows_matching(table, &columns, &values)?.len() > 1 {
                        return Err(constraint.violation(format!(
                            "{row} duplicates key ({})",
                            display_values(&values)
                        )));
                    }
                }
            }
            ConstraintKind::ForeignKey {
                ref_table,
                ref_columns,
            } => {
                let ref_schema = lookup.schema(ref_table)?;
                let targets = column_positions(&ref_schema, ref_columns)?;
                for row in rows {
                    let values = read_cells(lookup, table, *row, &columns)?;
                    if values.iter().any(Value::is_null) {
                        continue;
                    }
                    if lookup.rows_matching(ref_table, &targets, &values)?.is_empty() {
                        return Err(constraint.violation(format!(
                            "{row} references missing ({}) in {ref_table}",
                            display_values(&values)
                        )));
                    }
                }
            }
            ConstraintKind::Check { expression } => {
                let all: Vec<usize> = (0..schema.column_count()).collect();
                for row in rows {
                    let values = read_cells(lookup, table, *row, &all)?;
                    let resolver = RowValues::new(&schema, values);
                    match expression.evaluate(&resolver)? {
                        Value::Boolean(true) | Value::Null => {}
                        Value::Boolean(false) => {
                            return Err(constraint.violation(format!("{row} fails the check")))
                        }
                        other => {
                            return Err(CoreError::invalid_operation(format!(
                                "check {} evaluated to non-boolean {other}",
                                constraint.name
                            )))
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Checks foreign keys referencing `table` against rows removed from it.
///
/// A removed key is only a problem if no remaining row of `table` still
/// carries it, so an update that keeps the key passes.
pub(crate) fn check_removed(
    lookup: &mut dyn ConstraintLookup,
    constraints: &[&Constraint],
    table: &str,
    rows: &[RowId],
) -> CoreResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let schema = lookup.schema(table)?;
    for constraint in constraints {
        let ConstraintKind::ForeignKey {
            ref_table,
            ref_columns,
        } = &constraint.kind
        else {
            continue;
        };
        if ref_table != table {
            continue;
        }
        let keys = column_positions(&schema, ref_columns)?;
        let child_schema = lookup.schema(&constraint.table)?;
        let children = column_positions(&child_schema, &constraint.columns)?;
        for row in rows {
            let values = read_cells(lookup, table, *row, &keys)?;
            if values.iter().any(Value::is_null) {
                continue;
            }
            if !lookup.rows_matching(table, &keys, &values)?.is_empty() {
                continue;
            }
            if !lookup.rows_matching(&constraint.table, &children, &values)?.is_empty() {
                return Err(constraint.violation(format!(
                    "({}) removed from {table} is still referenced",
                    display_values(&values)
                )));
            }
        }
    }
    Ok(())
}

fn display_values(values: &[Value]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
