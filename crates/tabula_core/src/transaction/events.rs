//! Commit modification notifications.
//!
//! Higher layers (triggers, materialized views) learn about committed
//! changes here. Before-commit handlers run inside the commit, after every
//! check passed and before anything is applied, and may veto the commit by
//! returning an error. Subscribers receive an event per changed table once
//! the commit is durable.
//!
//! ```rust,ignore
//! let rx = db.subscribe();
//! std::thread::spawn(move || {
//!     while let Ok(event) = rx.recv() {
//!         println!("{}: +{} -{}", event.table, event.added.len(), event.removed.len());
//!     }
//! });
//! ```

use crate::error::CoreResult;
use crate::types::{CommitId, RowId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Rows one commit added to and removed from one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitModificationEvent {
    /// The commit.
    pub commit_id: CommitId,
    /// Table name.
    pub table: String,
    /// Rows added, sorted.
    pub added: Vec<RowId>,
    /// Rows removed, sorted.
    pub removed: Vec<RowId>,
}

/// Handler run before a commit to a table is applied.
pub type BeforeCommitHandler = Arc<dyn Fn(&CommitModificationEvent) -> CoreResult<()> + Send + Sync>;

/// Registered commit handlers and subscribers.
#[derive(Default)]
pub struct CommitListeners {
    before: RwLock<HashMap<String, Vec<BeforeCommitHandler>>>,
    subscribers: RwLock<Vec<Sender<CommitModificationEvent>>>,
}

impl std::fmt::Debug for CommitListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitListeners")
            .field("tables", &self.before.read().len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl CommitListeners {
    /// Creates an empty listener set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for commits changing `table`.
    pub fn on_before_commit<F>(&self, table: impl Into<String>, handler: F)
    where
        F: Fn(&CommitModificationEvent) -> CoreResult<()> + Send + Sync + 'static,
    {
        self.before
            .write()
            .entry(table.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Subscribes to after-commit events.
    pub fn subscribe(&self) -> Receiver<CommitModificationEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Runs the before-commit handlers of `event.table`.
    ///
    /// # Errors
    ///
    /// Returns the first handler error.
    pub fn fire_before(&self, event: &CommitModificationEvent) -> CoreResult<()> {
        let handlers: Vec<BeforeCommitHandler> = self
            .before
            .read()
            .get(&event.table)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(event)?;
        }
        Ok(())
    }

    /// Sends `event` to every live subscriber, forgetting disconnected ones.
    pub fn emit(&self, event: &CommitModificationEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Forgets the handlers of `table`.
    pub fn remove_table(&self, table: &str) {
        self.before.write().remove(table);
    }
}
