pub mod consumer;
pub mod item;
pub mod state;
