//! The commit coordinator.
//!
//! A commit runs under the commit lock in two phases. Validation checks
//! the transaction against everything committed since its snapshot and
//! against the constraints in force; any failure aborts the transaction
//! and leaves committed state untouched. Apply then flips row states,
//! publishes index lists and catalog changes, and advances the last
//! commit id. Once apply starts there is no way back: a storage failure
//! part way through closes the database.

use super::check::CheckTransaction;
use super::constraint::{self, Constraint, ConstraintLookup, ConstraintRegistry};
use super::events::CommitModificationEvent;
use super::{ObjectName, Transaction, TransactionState};
use crate::error::{ConflictKind, CoreError, CoreResult};
use crate::registry::TableEntry;
use crate::table::MasterTable;
use crate::types::{CommitId, TableId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Outcome of a successful validation.
struct Validated {
    check: CheckTransaction,
    constraints: ConstraintRegistry,
    events: Vec<CommitModificationEvent>,
}

pub(super) fn commit(txn: &mut Transaction) -> CoreResult<CommitId> {
    txn.ensure_active()?;
    let db = Arc::clone(&txn.db);
    db.ensure_open()?;

    if !txn.has_changes() {
        txn.state = TransactionState::Committed;
        txn.views.clear();
        db.manager.finish(txn.id);
        db.env.stats.record_transaction_commit();
        return Ok(txn.snapshot);
    }

    let guard = db.manager.commit_lock();
    db.ensure_open()?;
    txn.state = TransactionState::Committing;
    let commit_id = db.manager.next_commit_id();

    let validated = match validate(txn, commit_id) {
        Ok(validated) => validated,
        Err(err) => {
            abort(txn, &err);
            return Err(err);
        }
    };
    if let Err(err) = preflight(txn, &validated) {
        abort(txn, &err);
        return Err(err);
    }
    let names = txn.touched_names();
    let events = validated.events.clone();
    if let Err(err) = apply(txn, commit_id, validated, names) {
        fail(txn, commit_id, &err);
        return Err(err);
    }

    txn.state = TransactionState::Committed;
    txn.views.clear();
    txn.created.clear();
    db.manager.finish(txn.id);
    db.maintain();
    let checkpoint = if db.config.checkpoint_on_commit {
        db.checkpoint()
    } else {
        Ok(())
    };
    drop(guard);

    for event in &events {
        db.listeners.emit(event);
    }
    db.env.stats.record_transaction_commit();
    tracing::debug!(txn = %txn.id, %commit_id, tables = events.len(), "committed transaction");
    checkpoint.map(|()| commit_id)
}

/// Discards a transaction whose commit failed.
fn abort(txn: &mut Transaction, err: &CoreError) {
    if let Err(undo) = txn.discard() {
        tracing::warn!(txn = %txn.id, error = %undo, "failed to discard aborted transaction");
    }
    txn.state = TransactionState::Aborted;
    let stats = &txn.db.env.stats;
    stats.record_transaction_abort();
    if err.is_conflict() {
        stats.record_conflict();
    } else if err.is_constraint_violation() {
        stats.record_constraint_violation();
    }
    tracing::info!(txn = %txn.id, error = %err, "transaction aborted at commit");
}

/// Ends a transaction whose apply phase failed with committed state
/// possibly changed. The commit id is published so it is never handed out
/// again, and the database is closed without a checkpoint so the last
/// durable image stays as it was.
///
/// Callers hold the commit lock.
fn fail(txn: &mut Transaction, commit_id: CommitId, err: &CoreError) {
    let db = Arc::clone(&txn.db);
    tracing::error!(txn = %txn.id, %commit_id, error = %err, "commit failed while applying, closing database");
    db.manager.publish(commit_id);
    txn.views.clear();
    txn.created.clear();
    txn.dropped.clear();
    txn.state = TransactionState::Failed;
    db.manager.finish(txn.id);
    db.env.stats.record_transaction_abort();
    db.close_after_failure();
}

fn validate(txn: &mut Transaction, commit_id: CommitId) -> CoreResult<Validated> {
    let db = Arc::clone(&txn.db);
    let snapshot = txn.snapshot;
    let latest: BTreeMap<String, Arc<MasterTable>> = db.catalog.read().visible.clone();

    if db.config.error_on_dirty_select {
        for (name, view) in &txn.views {
            if view.was_selected() && !txn.created.contains(name) && view.table().changed_since(snapshot) {
                return Err(CoreError::conflict(
                    ConflictKind::DirtySelect,
                    Some(name),
                    format!("read at {snapshot} but changed by a later commit"),
                ));
            }
        }
    }

    let names = txn.touched_names();
    if let Some(name) = db.namespace.lock().test_clash(snapshot, &names) {
        return Err(CoreError::conflict(
            ConflictKind::NamespaceClash,
            None,
            format!("{name} was created or dropped by a concurrent commit"),
        ));
    }

    for (name, view) in &txn.views {
        if !view.is_changed() || txn.created.contains(name) {
            continue;
        }
        let table = view.table();
        if !latest.get(name).is_some_and(|t| Arc::ptr_eq(t, table)) {
            return Err(CoreError::conflict(
                ConflictKind::TableDropped,
                Some(name),
                "dropped by a concurrent commit",
            ));
        }
        for other in table.journals_since(snapshot) {
            if let Some(row) = view.journal().test_commit_clash(&other) {
                return Err(CoreError::conflict(
                    ConflictKind::RowClash,
                    Some(name),
                    format!("{row} was removed by a concurrent commit"),
                ));
            }
        }
    }

    for table in &txn.dropped {
        if table.changed_since(snapshot) {
            return Err(CoreError::conflict(
                ConflictKind::DroppedTableModified,
                Some(table.name()),
                "modified by a concurrent commit",
            ));
        }
    }

    let dropped: BTreeSet<&str> = txn.dropped.iter().map(|t| t.name()).collect();
    let others: Vec<Arc<MasterTable>> = latest
        .iter()
        .filter(|(name, _)| !dropped.contains(name.as_str()))
        .map(|(_, table)| Arc::clone(table))
        .collect();
    let created = &txn.created;
    let views = txn
        .views
        .iter_mut()
        .filter(|(name, _)| created.contains(*name) || latest.contains_key(*name))
        .map(|(_, view)| view);
    let mut check = CheckTransaction::build(views, others, snapshot)?;

    let mut effective = db.constraints.read().clone();
    for name in &txn.dropped_constraints {
        effective.remove(name);
    }
    for table in &txn.dropped {
        effective.remove_table(table.name());
    }
    let mut recheck: Vec<Constraint> = Vec::new();
    for name in &txn.added_constraints {
        if let Some(c) = txn.constraints.get(name) {
            effective.add(c.clone())?;
            recheck.push(c.clone());
        }
    }
    for table in &txn.dropped {
        let name = table.name();
        if txn.created.contains(name) {
            for fk in effective.referencing(name) {
                if !recheck.iter().any(|c| c.name == fk.name) {
                    recheck.push(fk.clone());
                }
            }
        } else if let Some(fk) = effective.referencing(name).next() {
            return Err(CoreError::constraint_violation(
                &fk.name,
                &fk.table,
                format!("{} references dropped table {name}", fk.table),
            ));
        }
    }

    let events: Vec<CommitModificationEvent> = txn
        .views
        .iter()
        .filter(|(_, view)| view.is_changed())
        .map(|(name, view)| CommitModificationEvent {
            commit_id,
            table: name.clone(),
            added: view.journal().normalized_added_rows(),
            removed: view.journal().normalized_removed_rows(),
        })
        .collect();

    let all: Vec<&Constraint> = effective.iter().collect();
    for event in &events {
        constraint::check_added(&mut check, &all, &event.table, &event.added)?;
        constraint::check_removed(&mut check, &all, &event.table, &event.removed)?;
    }
    for c in &recheck {
        let rows = check.rows_matching(&c.table, &[], &[])?;
        constraint::check_added(&mut check, &[c], &c.table, &rows)?;
    }

    for event in &events {
        db.listeners.fire_before(event)?;
    }

    Ok(Validated {
        check,
        constraints: effective,
        events,
    })
}

/// Checks, without writing, that every changed table can take its index
/// set.
fn preflight(txn: &Transaction, validated: &Validated) -> CoreResult<()> {
    for (name, view) in &txn.views {
        if view.is_changed() {
            view.table().check_index_set(validated.check.index_set(name)?)?;
        }
    }
    Ok(())
}

fn apply(
    txn: &mut Transaction,
    commit_id: CommitId,
    validated: Validated,
    names: BTreeSet<ObjectName>,
) -> CoreResult<()> {
    let db = Arc::clone(&txn.db);
    let Validated {
        check, constraints, ..
    } = validated;

    let mut created = Vec::new();
    for (name, view) in &mut txn.views {
        let table = Arc::clone(view.table());
        if view.is_changed() {
            let journal = view.take_journal();
            table.commit_transaction_change(commit_id, journal, check.index_set(name)?)?;
        }
        if txn.created.contains(name) {
            created.push((name.clone(), table));
        }
    }
    drop(check);

    let entries: Vec<TableEntry> = created
        .iter()
        .map(|(_, t)| TableEntry {
            id: t.id(),
            header: t.header_area(),
        })
        .collect();
    let dropped_ids: Vec<TableId> = txn.dropped.iter().map(|t| t.id()).collect();
    {
        let mut registry = db.registry.lock();
        registry.apply(&entries, &dropped_ids, commit_id)?;
        registry.record_commit(commit_id)?;
    }
    {
        let mut catalog = db.catalog.write();
        for table in txn.dropped.drain(..) {
            if catalog
                .visible
                .get(table.name())
                .is_some_and(|t| Arc::ptr_eq(t, &table))
            {
                catalog.visible.remove(table.name());
            }
            if !txn.created.contains(table.name()) {
                db.listeners.remove_table(table.name());
            }
            catalog.dropped.push((table, commit_id));
        }
        for (name, table) in created {
            catalog.visible.insert(name, table);
        }
    }
    *db.constraints.write() = constraints;
    db.namespace.lock().record(commit_id, names);
    db.manager.publish(commit_id);
    Ok(())
}
