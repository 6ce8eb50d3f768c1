//! Seams to the collaborators the reactor depends on.

pub mod queue;
pub mod store;

pub use queue::ActionQueue;
pub use store::{ContractStore, QueryOptions, SortDirection};
