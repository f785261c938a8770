mod error;
mod loader;
mod model;
mod raw;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_from_path, load_from_str};
pub use model::Config;
