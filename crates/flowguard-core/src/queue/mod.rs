//! Durable, priority-ordered, deduplicating action queue.
//!
//! `ActionQueue` is the single source of truth for action state. The
//! dispatcher never touches a `QueuedAction` directly — every transition
//! goes through `claim_next` / `complete` / `sweep`, each of which runs in
//! one redb write transaction.

pub mod db;

pub use db::ActionQueue;
