pub mod cli;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod errors;
pub mod lock;
pub mod mainconf;
pub mod mta;
pub mod schema;
pub mod store;
pub mod validate;
pub mod vault;

pub use engine::Engine;
pub use errors::{Result, StageError};
