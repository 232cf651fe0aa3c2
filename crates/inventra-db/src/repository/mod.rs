//! # Repository Module
//!
//! Repository implementations for the local store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Each repository owns the SQL for one table and exposes typed          │
//! │  operations on inventra-core types.                                    │
//! │                                                                         │
//! │  inventra-sync                                                          │
//! │       │  db.mutations().claim(id, now)                                  │
//! │       ▼                                                                 │
//! │  MutationQueueRepository                                               │
//! │  ├── enqueue / get / list_unsynced                                     │
//! │  ├── claim / mark_synced / release_for_retry / mark_failed             │
//! │  └── stats / prune / recover_in_flight                                 │
//! │       │  SQL                                                            │
//! │       ▼                                                                 │
//! │  SQLite (mutation_queue)                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`cache::CacheRepository`] - Named snapshots with a byte quota
//! - [`queue::MutationQueueRepository`] - Durable outbound mutation queue
//! - [`conflict::ConflictRepository`] - Conflict audit log

pub mod cache;
pub mod conflict;
pub mod queue;
