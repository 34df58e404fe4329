use config::load_config;
use config::shared::MigratorConfig;

/// Loads and validates the worker configuration from `./configuration`.
pub fn load_migrator_config() -> anyhow::Result<MigratorConfig> {
    let config = load_config::<MigratorConfig>()?;
    config.validate()?;

    Ok(config)
}
