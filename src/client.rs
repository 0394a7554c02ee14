//! Client facade over the scheduler and its gates.
//!
//! `core` holds the request and status surface, `builder` the construction path,
//! and `batch` the grouped submission helper.

mod batch;
pub mod builder;
pub mod core;

pub use builder::ApiClientBuilder;
pub use core::ApiClient;
