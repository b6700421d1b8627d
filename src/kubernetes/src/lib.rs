pub mod binding;
pub mod context;
pub mod controller;
pub mod crd;
pub mod error;
pub mod fixture;
pub mod retry;
pub mod util;
