//! Client-side sync core for a collaborative task board.
//!
//! Merges the owned and shared category feeds into one view, tracks who is
//! editing what, applies edits optimistically with throttled remote writes,
//! and offers local search and deadline alerts over the merged snapshot.

pub mod activity;
pub mod board;
pub mod client;
pub mod clock;
pub mod config;
pub mod merge;
pub mod mutation;
pub mod notify;
pub mod presence;
pub mod search;
pub mod session;
pub mod storage;
pub mod types;

pub use client::BoardClient;
pub use session::UserSession;
