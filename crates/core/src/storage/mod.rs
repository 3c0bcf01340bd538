pub mod memory;
pub mod records;
pub mod redb_store;

pub use memory::InMemoryRecordStore;
pub use records::{RecordStore, RecordUpdate};
pub use redb_store::RedbRecordStore;
