pub mod loader;
pub mod schema;

pub use loader::{load_from_env, load_from_path, validate};
pub use schema::{PluginSettings, PluginVariant, RawConfig};
