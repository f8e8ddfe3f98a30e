use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub server_url: Option<String>,
    pub api_key: Option<String>,
}

impl Config {
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?
            .join("stash");
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir.join("config.toml"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        std::fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Effective server URL: CLI flag beats config file.
    pub fn server_url(&self, flag: Option<&str>) -> anyhow::Result<String> {
        flag.map(String::from)
            .or_else(|| self.server_url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("no server configured; pass --server or run: stash configure")
            })
    }

    pub fn api_key(&self, flag: Option<&str>) -> Option<String> {
        flag.map(String::from).or_else(|| self.api_key.clone())
    }
}
