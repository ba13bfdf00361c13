//! Side-effecting operations: durable state, subprocess collaborators,
//! retry. Isolated from `core` to keep the deterministic logic mockable.

pub mod checkpoint_store;
pub mod engine;
pub mod feed;
pub mod process;
pub mod retry;
pub mod surface;
