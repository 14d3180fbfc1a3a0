//! rollcall-store — SQLite persistence for enrolled identities and attendance.
//!
//! Encodings are stored as 1024-byte blobs of little-endian f64 values.

pub mod sqlite;

pub use sqlite::SqliteStore;
