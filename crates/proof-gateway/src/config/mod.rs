#[allow(clippy::module_inception)]
pub mod config;

pub use config::{Config, JobSection, ProverSection, RelaySection, APP_HOME, CONFIG_DIR, CONFIG_FILE};
