//! Transactions and the commit coordinator.
//!
//! Tabula transactions run under snapshot isolation:
//! - **Snapshots**: a transaction sees the tables as of the last commit
//!   before it began, plus its own changes
//! - **Optimistic writes**: changes go to per-table journals and nothing
//!   is locked until commit
//! - **Serializable commits**: one commit at a time checks for conflicts
//!   against everything committed since the snapshot
//! - **Atomicity**: either every table's changes land or none do

mod check;
mod commit;
pub mod constraint;
pub mod events;
mod manager;
pub mod namespace;
mod state;

pub use constraint::{
    CheckExpression, Constraint, ConstraintKind, ConstraintRegistry, Deferrability, RowResolver,
    RowValues,
};
pub use events::{BeforeCommitHandler, CommitListeners, CommitModificationEvent};
pub use manager::TransactionManager;
pub use namespace::{NamespaceHistory, NamespaceJournal, ObjectName};
pub use state::TransactionState;

use crate::database::Conglomerate;
use crate::error::{CoreError, CoreResult};
use crate::schema::TableSchema;
use crate::table::{MasterTable, TableView};
use crate::types::{CommitId, RowId, TransactionId};
use crate::value::Value;
use constraint::ConstraintLookup;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// An open transaction.
///
/// Dropping an active transaction rolls it back.
pub struct Transaction {
    db: Arc<Conglomerate>,
    id: TransactionId,
    snapshot: CommitId,
    state: TransactionState,
    views: BTreeMap<String, TableView>,
    created: BTreeSet<String>,
    dropped: Vec<Arc<MasterTable>>,
    constraints: ConstraintRegistry,
    added_constraints: Vec<String>,
    dropped_constraints: Vec<String>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot)
            .field("state", &self.state)
            .field("tables", &self.views.len())
            .finish_non_exhaustive()
    }
}

/// Constraint lookups through a transaction's own views.
struct ViewLookup<'a> {
    views: &'a mut BTreeMap<String, TableView>,
}

impl ViewLookup<'_> {
    fn view(&mut self, table: &str) -> CoreResult<&mut TableView> {
        self.views
            .get_mut(table)
            .ok_or_else(|| CoreError::table_not_found(table))
    }
}

impl ConstraintLookup for ViewLookup<'_> {
    fn schema(&self, table: &str) -> CoreResult<Arc<TableSchema>> {
        self.views
            .get(table)
            .map(|v| Arc::clone(v.schema()))
            .ok_or_else(|| CoreError::table_not_found(table))
    }

    fn rows_matching(&mut self, table: &str, columns: &[usize], values: &[Value]) -> CoreResult<Vec<RowId>> {
        self.view(table)?.rows_matching(columns, values)
    }

    fn read_cell(&mut self, table: &str, row: RowId, column: usize) -> CoreResult<Value> {
        self.view(table)?.read_cell(row, column)
    }
}

impl Transaction {
    pub(crate) fn new(
        db: Arc<Conglomerate>,
        id: TransactionId,
        snapshot: CommitId,
        views: BTreeMap<String, TableView>,
        constraints: ConstraintRegistry,
    ) -> Self {
        Self {
            db,
            id,
            snapshot,
            state: TransactionState::Active,
            views,
            created: BTreeSet::new(),
            dropped: Vec::new(),
            constraints,
            added_constraints: Vec::new(),
            dropped_constraints: Vec::new(),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The last commit this transaction's snapshot includes.
    #[must_use]
    pub fn snapshot(&self) -> CommitId {
        self.snapshot
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub(crate) fn belongs_to(&self, db: &Arc<Conglomerate>) -> bool {
        Arc::ptr_eq(&self.db, db)
    }

    fn ensure_active(&self) -> CoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "transaction {} is {}",
                self.id, self.state
            )))
        }
    }

    /// Names of the tables visible to the transaction.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.views.keys().cloned().collect()
    }

    /// The transaction's view of `name`.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if the table is not visible.
    pub fn table(&mut self, name: &str) -> CoreResult<&mut TableView> {
        self.ensure_active()?;
        self.views
            .get_mut(name)
            .ok_or_else(|| CoreError::table_not_found(name))
    }

    /// Creates a table, visible to others once the transaction commits.
    ///
    /// # Errors
    ///
    /// Returns `TableExists` if the name is taken, or an error if the
    /// schema is invalid.
    pub fn create_table(&mut self, schema: TableSchema) -> CoreResult<()> {
        self.ensure_active()?;
        let name = schema.name.clone();
        if self.views.contains_key(&name) {
            return Err(CoreError::TableExists { name });
        }
        schema.validate()?;
        let id = self.db.registry.lock().allocate_table_id()?;
        let table = MasterTable::create(&self.db.env, id, schema)?;
        let set = table.create_index_set()?;
        self.views.insert(name.clone(), TableView::new(table, set));
        self.created.insert(name);
        Ok(())
    }

    /// Drops a table.
    ///
    /// Changes made to it in this transaction are discarded, and so are its
    /// constraints.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if the table is not visible, or a constraint
    /// violation if another table's foreign key references it.
    pub fn drop_table(&mut self, name: &str) -> CoreResult<()> {
        self.ensure_active()?;
        if !self.views.contains_key(name) {
            return Err(CoreError::table_not_found(name));
        }
        if let Some(fk) = self.constraints.referencing(name).next() {
            return Err(CoreError::constraint_violation(
                &fk.name,
                &fk.table,
                format!("{} references {name}", fk.table),
            ));
        }
        let Some(view) = self.views.remove(name) else {
            return Err(CoreError::table_not_found(name));
        };
        let (table, set, journal) = view.into_parts();
        drop(set);

        let on_table: Vec<String> = self
            .constraints
            .on_table(name)
            .map(|c| c.name.clone())
            .collect();
        self.constraints.remove_table(name);
        self.added_constraints.retain(|c| !on_table.contains(c));

        if self.created.remove(name) {
            table.drop_storage()
        } else {
            table.rollback_transaction_change(&journal)?;
            self.dropped.push(table);
            Ok(())
        }
    }

    /// Inserts a row, checking immediate constraints.
    ///
    /// # Errors
    ///
    /// Returns an error if the row is invalid or violates a constraint; the
    /// insert is then undone.
    pub fn insert(&mut self, table: &str, values: &[Value]) -> CoreResult<RowId> {
        let row = self.table(table)?.add_row(values)?;
        self.guard_immediate(table, &[row], &[], 1)?;
        Ok(row)
    }

    /// Replaces a row, checking immediate constraints. Returns the id of
    /// the new row version.
    ///
    /// # Errors
    ///
    /// Returns an error if the row is not visible, the values are invalid
    /// or a constraint is violated; the update is then undone.
    pub fn update(&mut self, table: &str, row: RowId, values: &[Value]) -> CoreResult<RowId> {
        let replacement = self.table(table)?.update_row(row, values)?;
        self.guard_immediate(table, &[replacement], &[row], 2)?;
        Ok(replacement)
    }

    /// Deletes a row, checking immediate constraints.
    ///
    /// # Errors
    ///
    /// Returns an error if the row is not visible or a constraint is
    /// violated; the delete is then undone.
    pub fn delete(&mut self, table: &str, row: RowId) -> CoreResult<()> {
        self.table(table)?.remove_row(row)?;
        self.guard_immediate(table, &[], &[row], 1)
    }

    /// Runs immediate checks for one operation and undoes its `entries`
    /// journal entries if they fail.
    fn guard_immediate(
        &mut self,
        table: &str,
        added: &[RowId],
        removed: &[RowId],
        entries: usize,
    ) -> CoreResult<()> {
        let immediate: Vec<&constraint::Constraint> = self
            .constraints
            .iter()
            .filter(|c| !c.is_deferred())
            .collect();
        if immediate.is_empty() {
            return Ok(());
        }
        let mut lookup = ViewLookup {
            views: &mut self.views,
        };
        let outcome = constraint::check_added(&mut lookup, &immediate, table, added)
            .and_then(|()| constraint::check_removed(&mut lookup, &immediate, table, removed));
        if let Err(err) = outcome {
            if err.is_constraint_violation() {
                self.db.env.stats.record_constraint_violation();
            }
            self.table(table)?.rollback_entries(entries)?;
            return Err(err);
        }
        Ok(())
    }

    /// Adds a constraint. Existing rows are checked now and again at
    /// commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the constraint names unknown tables or columns,
    /// its name is taken, or existing rows violate it.
    pub fn add_constraint(&mut self, constraint: Constraint) -> CoreResult<()> {
        self.ensure_active()?;
        let schema = Arc::clone(self.table(&constraint.table)?.schema());
        for column in &constraint.columns {
            schema.require_column(column)?;
        }
        if let ConstraintKind::ForeignKey {
            ref_table,
            ref_columns,
        } = &constraint.kind
        {
            let ref_schema = Arc::clone(self.table(ref_table)?.schema());
            for column in ref_columns {
                ref_schema.require_column(column)?;
            }
            if ref_columns.len() != constraint.columns.len() {
                return Err(CoreError::invalid_operation(format!(
                    "foreign key {} maps {} columns onto {}",
                    constraint.name,
                    constraint.columns.len(),
                    ref_columns.len()
                )));
            }
        }

        let name = constraint.name.clone();
        let table = constraint.table.clone();
        self.constraints.add(constraint.clone())?;
        let rows = self.table(&table)?.rows_matching(&[], &[])?;
        let mut lookup = ViewLookup {
            views: &mut self.views,
        };
        if let Err(err) = constraint::check_added(&mut lookup, &[&constraint], &table, &rows) {
            self.constraints.remove(&name);
            return Err(err);
        }
        self.added_constraints.push(name);
        Ok(())
    }

    /// Drops the constraint called `name`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if there is no such constraint.
    pub fn drop_constraint(&mut self, name: &str) -> CoreResult<()> {
        self.ensure_active()?;
        if self.constraints.remove(name).is_none() {
            return Err(CoreError::invalid_operation(format!(
                "no constraint named {name}"
            )));
        }
        if let Some(pos) = self.added_constraints.iter().position(|c| c == name) {
            self.added_constraints.remove(pos);
        } else {
            self.dropped_constraints.push(name.to_owned());
        }
        Ok(())
    }

    /// Constraints in force for this transaction.
    #[must_use]
    pub fn constraints(&self) -> &ConstraintRegistry {
        &self.constraints
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` if the database was closed; the transaction
    /// stays active. Returns a conflict or constraint violation if a commit
    /// check fails, after which the transaction is aborted and its changes
    /// discarded. A storage error while the commit is being applied leaves
    /// the transaction [`TransactionState::Failed`] and closes the
    /// database.
    pub fn commit(&mut self) -> CoreResult<CommitId> {
        commit::commit(self)
    }

    /// Rolls back the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or its changes
    /// cannot be undone.
    pub fn rollback(&mut self) -> CoreResult<()> {
        self.ensure_active()?;
        let result = self.discard();
        self.state = TransactionState::RolledBack;
        self.db.env.stats.record_transaction_rollback();
        tracing::debug!(txn = %self.id, "rolled back transaction");
        result
    }

    /// Whether the transaction changed anything.
    fn has_changes(&self) -> bool {
        self.views.values().any(TableView::is_changed)
            || !self.created.is_empty()
            || !self.dropped.is_empty()
            || !self.added_constraints.is_empty()
            || !self.dropped_constraints.is_empty()
    }

    /// Schema object names the transaction creates or drops.
    fn touched_names(&self) -> BTreeSet<ObjectName> {
        let mut names: BTreeSet<ObjectName> = self
            .created
            .iter()
            .cloned()
            .map(ObjectName::Table)
            .collect();
        names.extend(
            self.dropped
                .iter()
                .map(|t| ObjectName::Table(t.name().to_owned())),
        );
        names.extend(
            self.added_constraints
                .iter()
                .chain(&self.dropped_constraints)
                .cloned()
                .map(ObjectName::Constraint),
        );
        names
    }

    /// Undoes every change and unregisters the transaction.
    fn discard(&mut self) -> CoreResult<()> {
        let mut first_err = None;
        for (name, view) in std::mem::take(&mut self.views) {
            let (table, set, journal) = view.into_parts();
            drop(set);
            let result = if self.created.contains(&name) {
                table.drop_storage()
            } else {
                table.rollback_transaction_change(&journal)
            };
            if let Err(err) = result {
                tracing::warn!(table = %name, error = %err, "failed to undo table changes");
                first_err.get_or_insert(err);
            }
        }
        self.created.clear();
        self.dropped.clear();
        self.db.manager.finish(self.id);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            let _ = self.rollback();
        }
    }
}
