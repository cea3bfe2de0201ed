//! Index Set Store: persisted, versioned row-id lists.
//!
//! Each table owns one [`IndexSetStore`]. Index 0 lists the rows visible
//! in the table; every indexed column owns one more list ordering row ids
//! by that column's value.
//!
//! Transactions read through an [`IndexSet`] snapshot whose lists are
//! private [`IndexIntegerList`] working copies. Commits write the changed
//! lists back as new node versions without touching the blocks older
//! snapshots still read.

pub mod compact;
mod list;
mod set;
mod store;

pub use list::{BlockDescriptor, IndexIntegerList};
pub use set::IndexSet;
pub use store::IndexSetStore;
