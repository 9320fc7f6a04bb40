//! TOML configuration: schema, loading and validation

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::{Config, OptionsSection, ProxySection};
pub use validator::ConfigValidator;
