mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{
    BrokerSettings, LoggingSettings, RetrySettings, Settings, StorageSettings, SubscriberSettings,
};

/// Prefix of every environment variable read by `load_config`.
pub const ENV_PREFIX: &str = "PARTSUB";

/// Loads the configuration from `config/default` and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing every configuration section
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config")
}

/// Same as `load_config`, reading `default.*` from `dir` instead.
///
/// A `.env` file in the working directory is loaded first; variables already
/// present in the environment win over it. Environment variables look like
/// `PARTSUB_BROKER__THROTTLE_FACTOR=5`.
pub fn load_config_from(dir: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let default_file = dir.as_ref().join("default");
    let builder = Config::builder()
        .add_source(File::with_name(&default_file.to_string_lossy()).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    Ok(partial.merge_with_defaults())
}
