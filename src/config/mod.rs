mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{HubSettings, ServerSettings, Settings, StoreSettings};

/// Loads the configuration from `config/default` and the environment.
///
/// Environment variables use the `ROOMCAST` prefix and `__` between nested
/// keys, e.g. `ROOMCAST_HUB__SESSION_POLICY=single`. `hub.default_topics`
/// accepts a comma-separated list. Missing values fall back to
/// `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Like `load_config`, reading the optional file at `path` instead.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("ROOMCAST")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("hub.default_topics")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_defaults())
}
