// Core modules: on-disk formats, storage, indexing, encryption, and the engine.
pub mod btree;
pub mod catalog;
pub mod codec;
pub mod dir;
pub mod engine;
pub mod error;
pub mod format;
pub mod index;
pub mod keys;
pub mod predicate;
pub mod recovery;
pub mod schema;
pub mod table;
pub mod txn;
pub mod value;
pub mod verify;
pub mod wal;
