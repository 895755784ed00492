//! Engine configuration (`mtastage.toml`).

pub mod settings;

pub use settings::{MtaSettings, Settings};
