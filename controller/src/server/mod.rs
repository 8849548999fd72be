pub mod handlers;
pub mod intents;
pub mod serve;
pub mod state;
