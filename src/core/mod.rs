pub mod clock;
pub mod config;
pub mod io;
pub mod state;
