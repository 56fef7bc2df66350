/// Database connection and schema management
pub mod database;

/// Business rules loaded from config.toml
pub mod settings;

pub use settings::{Settings, load_settings};
