//! Side-effecting collaborators: stores, config, schemas, the execution
//! substrate, prompt rendering, and report parsing.

pub mod config;
pub mod file_store;
pub mod prompt;
pub mod report;
pub mod result_cache;
pub mod schema;
pub mod store;
pub mod substrate;
