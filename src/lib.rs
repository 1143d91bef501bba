pub mod api;
pub mod backend;
pub mod config;
pub mod controller;
pub mod dwell;
pub mod events;
pub mod grid;
pub mod position;
pub mod recorder;
pub mod session;
pub mod state;

#[cfg(test)]
mod testing;
