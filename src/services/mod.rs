pub mod api;
pub mod export;
pub mod persona;
pub mod progress;
pub mod workflow;
