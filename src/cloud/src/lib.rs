pub mod client;
pub mod error;
pub mod fake;
pub mod provider;
