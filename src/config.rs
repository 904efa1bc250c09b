use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::images::{BUNDLED_EXAMPLES, DecodeBounds};
use crate::keymgr::MasterKeySource;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub keyring: KeyringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub images: ImageConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Permanent directory: vault.db and encrypted images
    pub data_dir: Option<String>,
    /// Scratch directory for captured images not yet saved
    pub cache_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KeyringConfig {
    pub service: Option<String>,
    pub account: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Level: trace, debug, info, warn, error
    pub level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ImageConfig {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub max_decode_bytes: Option<u64>,
    pub scratch_max_age_hours: Option<u64>,
    pub bundled: Option<Vec<String>>,
}

/// The runtime config (final config)
pub struct Config {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub master_key_source: MasterKeySource,
    pub keyring_service: String,
    pub keyring_account: String,
    pub decode_bounds: DecodeBounds,
    pub scratch_max_age: Duration,
    pub bundled_examples: Vec<String>,
}

impl Config {
    /// Priority: CLI arg > env > config file > default value
    pub fn build(
        cli_data_dir: Option<PathBuf>,
        cli_cache_dir: Option<PathBuf>,
        master_key_source: MasterKeySource,
    ) -> Result<Self> {
        let config_file = Self::load_config_file()?;
        Self::from_parts(config_file, cli_data_dir, cli_cache_dir, master_key_source)
    }

    fn from_parts(
        config_file: ConfigFile,
        cli_data_dir: Option<PathBuf>,
        cli_cache_dir: Option<PathBuf>,
        master_key_source: MasterKeySource,
    ) -> Result<Self> {
        let data_dir = match cli_data_dir
            .or_else(|| std::env::var("CARDVAULT_DATA_DIR").ok().map(PathBuf::from))
            .or_else(|| config_file.storage.data_dir.as_ref().map(PathBuf::from))
        {
            Some(dir) => dir,
            None => dirs::data_dir()
                .context("Cannot determine user data directory")?
                .join("cardvault"),
        };

        let cache_dir = match cli_cache_dir
            .or_else(|| std::env::var("CARDVAULT_CACHE_DIR").ok().map(PathBuf::from))
            .or_else(|| config_file.storage.cache_dir.as_ref().map(PathBuf::from))
        {
            Some(dir) => dir,
            None => dirs::cache_dir()
                .context("Cannot determine user cache directory")?
                .join("cardvault"),
        };

        let keyring_service = std::env::var("CARDVAULT_KEYRING_SERVICE")
            .ok()
            .or_else(|| config_file.keyring.service.clone())
            .unwrap_or_else(|| "cardvault".to_string());

        let keyring_account = std::env::var("CARDVAULT_KEYRING_ACCOUNT")
            .ok()
            .or_else(|| config_file.keyring.account.clone())
            .unwrap_or_else(|| "vault-key".to_string());

        let images = &config_file.images;
        let defaults = DecodeBounds::default();
        let decode_bounds = DecodeBounds {
            max_width: images.max_width.unwrap_or(defaults.max_width),
            max_height: images.max_height.unwrap_or(defaults.max_height),
            max_alloc: images.max_decode_bytes.unwrap_or(defaults.max_alloc),
        };
        let scratch_max_age = Duration::from_secs(
            images
                .scratch_max_age_hours
                .unwrap_or(24)
                .saturating_mul(3600),
        );
        let bundled_examples = images
            .bundled
            .clone()
            .unwrap_or_else(|| BUNDLED_EXAMPLES.iter().map(|s| s.to_string()).collect());

        Ok(Self {
            data_dir,
            cache_dir,
            master_key_source,
            keyring_service,
            keyring_account,
            decode_bounds,
            scratch_max_age,
            bundled_examples,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("vault.db")
    }

    /// Permanent, encrypted image directory.
    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.cache_dir.join("images")
    }

    pub fn load_config_file() -> Result<ConfigFile> {
        let config_path = Self::config_file_path()?;

        if !config_path.exists() {
            return Ok(ConfigFile::default());
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Cannot determine user config directory")?;

        Ok(config_dir.join("cardvault").join("config.toml"))
    }

    pub fn generate_example_config() -> Result<String> {
        let example = ConfigFile {
            storage: StorageConfig {
                data_dir: Some("/custom/path/to/cardvault".to_string()),
                cache_dir: Some("/custom/path/to/cache".to_string()),
            },
            keyring: KeyringConfig {
                service: Some("cardvault".to_string()),
                account: Some("vault-key".to_string()),
            },
            logging: LoggingConfig {
                level: Some("info".to_string()),
            },
            images: ImageConfig {
                max_width: Some(1920),
                max_height: Some(1920),
                max_decode_bytes: Some(256 * 1024 * 1024),
                scratch_max_age_hours: Some(24),
                bundled: Some(BUNDLED_EXAMPLES.iter().map(|s| s.to_string()).collect()),
            },
        };

        toml::to_string_pretty(&example).context("Failed to render example config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_key() -> MasterKeySource {
        MasterKeySource {
            base64_inline: None,
            allow_keyring: false,
        }
    }

    #[test]
    fn cli_paths_win_over_file() {
        let file: ConfigFile = toml::from_str(
            r#"
            [storage]
            data_dir = "/from/file"
            cache_dir = "/cache/file"
            [images]
            max_width = 640
            scratch_max_age_hours = 2
            "#,
        )
        .unwrap();
        let config = Config::from_parts(
            file,
            Some(PathBuf::from("/from/cli")),
            Some(PathBuf::from("/cache/cli")),
            no_key(),
        )
        .unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/from/cli/vault.db"));
        assert_eq!(config.scratch_dir(), PathBuf::from("/cache/cli/images"));
        assert_eq!(config.decode_bounds.max_width, 640);
        assert_eq!(config.decode_bounds.max_height, 1920);
        assert_eq!(config.scratch_max_age, Duration::from_secs(7200));
        assert_eq!(config.bundled_examples.len(), BUNDLED_EXAMPLES.len());
    }

    #[test]
    fn example_config_parses_back() {
        let text = Config::generate_example_config().unwrap();
        let parsed: ConfigFile = toml::from_str(&text).unwrap();
        assert_eq!(parsed.images.max_decode_bytes, Some(256 * 1024 * 1024));
        assert_eq!(parsed.keyring.account.as_deref(), Some("vault-key"));
    }

    #[test]
    fn huge_scratch_age_saturates() {
        let file: ConfigFile =
            toml::from_str("[images]\nscratch_max_age_hours = 9223372036854775807").unwrap();
        let config = Config::from_parts(
            file,
            Some(PathBuf::from("/d")),
            Some(PathBuf::from("/c")),
            no_key(),
        )
        .unwrap();
        assert_eq!(config.scratch_max_age, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn empty_file_is_default() {
        let parsed: ConfigFile = toml::from_str("").unwrap();
        assert!(parsed.storage.data_dir.is_none());
        assert!(parsed.images.bundled.is_none());
    }
}
