//! Intent API
//!
//! Wire models shared by the reconciler's HTTP intake and its callers.

pub mod models;
