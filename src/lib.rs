//! Purpose: Embedded storage engine with a write-ahead log, encrypted columns, and B+ tree indexes.
//! Exports: `api` (the `Database` handle and its types), `core` (engine internals).
//! Role: Library backing the `vaultdb` CLI and integration tests.
//! Invariants: `api` is the supported surface; `core` paths may change between releases.
pub mod api;
pub mod core;
