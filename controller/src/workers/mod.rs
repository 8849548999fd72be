pub mod reaper;
pub mod status;
