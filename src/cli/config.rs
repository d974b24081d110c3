//! `igloo-broker config` - show the effective configuration.

use std::path::Path;

use crate::config::BrokerConfig;
use crate::settings::Settings;

pub fn run_config_command(toml_path: Option<&Path>, init: bool) -> anyhow::Result<()> {
    if init {
        let path = toml_path
            .map(Path::to_path_buf)
            .unwrap_or_else(Settings::default_toml_path);
        if path.exists() {
            println!("Config file already exists: {}", path.display());
        } else {
            Settings::default()
                .save_toml(&path)
                .map_err(anyhow::Error::msg)?;
            println!("Wrote default config to {}", path.display());
        }
    }

    let config = BrokerConfig::from_env_with_toml(toml_path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
