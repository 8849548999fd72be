//! GitOps reconciler library
//!
//! Turns deployment intents into ordered, compensated changes across the
//! manifest repository, the CD application registry and the service catalog.

pub mod app;
pub mod errors;
pub mod filesys;
pub mod ledger;
pub mod logs;
pub mod models;
pub mod reconcile;
pub mod serializer;
pub mod server;
pub mod storage;
pub mod stores;
pub mod utils;
pub mod workers;
