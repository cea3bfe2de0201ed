//! Master tables and the per-transaction views over them.
//!
//! A [`MasterTable`] owns a table's rows, its slot list and its index set
//! store. Transactions never change a master table's visible state
//! directly: they record changes in a [`MasterTableJournal`] through a
//! [`TableView`], and the commit coordinator applies committed journals.

mod gc;
mod journal;
mod master;
pub mod record;
mod repair;
pub(crate) mod scheme;
mod slots;
mod view;

pub use gc::RowGarbageCollector;
pub use journal::{JournalCommand, JournalEntry, MasterTableJournal};
pub use master::{MasterTable, SlotSummary};
pub(crate) use master::TableEnv;
pub use repair::TableReport;
pub use scheme::ROW_LIST;
pub use slots::{RowStatus, Slot, SlotList, DELETED_FLAG};
pub use view::TableView;
