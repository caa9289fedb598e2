//! The hash table and block table (SPEC_FULL.md §4.3, §4.4).

pub mod block_table;
pub mod hash_table;

pub use block_table::{BlockEntry, BlockFlags, BlockTable, StorageMode};
pub use hash_table::{HashEntry, HashTable, LookupPolicy};
