pub mod component;
pub mod config;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod recovery;
pub mod server;
pub mod synchronizer;
pub mod webhook;
