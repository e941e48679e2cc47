pub mod config;
pub mod entities;
pub mod events;
pub mod runs;
