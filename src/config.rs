use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{AppError, AppResult};
use crate::session::Credentials;

const APP_DIR_NAME: &str = "Reel Publisher";
const CONFIG_PATH_ENV: &str = "REEL_PUBLISHER_CONFIG";

pub const DEFAULT_CAPTION: &str = "#lamborghini #carsofinstagram #huracan #lambo #lamborghinihuracan \
#porsche #gt3rs #992gt3rs #porsche911 #bmw #bmwm3 #bmws1000rr #bmwnation #bmwm #bmwperformance";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub account_username: String,
    pub account_password: Option<String>,
    pub manual_session_token: Option<String>,
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
    pub rate_limit_base_delay_seconds: u64,
    pub pre_publish_jitter_min_seconds: u64,
    pub pre_publish_jitter_max_seconds: u64,
    pub post_publish_cooldown_min_seconds: u64,
    pub post_publish_cooldown_max_seconds: u64,
    pub call_timeout_seconds: u64,
    pub confirmation_lookback: usize,
    pub bridge_url: String,
    pub content_dir: PathBuf,
    pub caption: String,
    pub generate_cover: bool,
    /// Where session files live; the platform data dir when unset.
    pub session_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account_username: String::new(),
            account_password: None,
            manual_session_token: None,
            max_attempts: 3,
            base_delay_seconds: 30,
            rate_limit_base_delay_seconds: 600,
            pre_publish_jitter_min_seconds: 20,
            pre_publish_jitter_max_seconds: 40,
            post_publish_cooldown_min_seconds: 30,
            post_publish_cooldown_max_seconds: 40,
            call_timeout_seconds: 120,
            confirmation_lookback: 5,
            bridge_url: "http://127.0.0.1:8765".to_string(),
            content_dir: PathBuf::from("output"),
            caption: DEFAULT_CAPTION.to_string(),
            generate_cover: true,
            session_dir: None,
        }
    }
}

impl Config {
    /// Build the immutable credential set, refusing to continue without one
    /// usable login path.
    pub fn credentials(&self) -> AppResult<Credentials> {
        let username = self.account_username.trim();
        if username.is_empty() {
            return Err(AppError::configuration_missing("account_username"));
        }

        let password = non_empty(&self.account_password);
        let manual_session_token = non_empty(&self.manual_session_token);
        if password.is_none() && manual_session_token.is_none() {
            return Err(AppError::configuration_missing(
                "account_password (or manual_session_token)",
            ));
        }

        Ok(Credentials {
            username: username.to_string(),
            password,
            manual_session_token,
        })
    }

    pub fn session_directory(&self) -> AppResult<PathBuf> {
        match &self.session_dir {
            Some(dir) => Ok(dir.clone()),
            None => get_data_directory().map(|d| d.join("sessions")),
        }
    }

    /// Apply `INSTA_*` / `REEL_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("INSTA_USERNAME") {
            self.account_username = v;
        }
        if let Some(v) = lookup("INSTA_PASSWORD") {
            self.account_password = Some(v);
        }
        if let Some(v) = lookup("INSTA_SESSIONID") {
            self.manual_session_token = Some(v);
        }
        if let Some(v) = lookup("REEL_MAX_ATTEMPTS") {
            self.max_attempts = parse_number("REEL_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("REEL_BASE_DELAY_SECONDS") {
            self.base_delay_seconds = parse_number("REEL_BASE_DELAY_SECONDS", &v)?;
        }
        if let Some(v) = lookup("REEL_RATE_LIMIT_BASE_DELAY_SECONDS") {
            self.rate_limit_base_delay_seconds =
                parse_number("REEL_RATE_LIMIT_BASE_DELAY_SECONDS", &v)?;
        }
        if let Some(v) = lookup("REEL_BRIDGE_URL") {
            self.bridge_url = v;
        }
        if let Some(v) = lookup("REEL_CONTENT_DIR") {
            self.content_dir = PathBuf::from(v);
        }
        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> AppResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::validation(name, "Must be a non-negative whole number"))
}

pub fn get_config_path() -> AppResult<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?
        .join(APP_DIR_NAME);

    fs::create_dir_all(&config_dir)?;
    Ok(config_dir.join("config.json"))
}

pub fn get_data_directory() -> AppResult<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| AppError::Config("Could not find data directory".to_string()))?
        .join(APP_DIR_NAME);

    fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}

/// Load the config file, write defaults when it is missing, then apply
/// environment overrides and validate.
pub fn load_config() -> AppResult<Config> {
    let mut config = load_config_file(&get_config_path()?)?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_config_file(config_path: &Path) -> AppResult<Config> {
    if config_path.exists() {
        let config_str = fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&config_str).unwrap_or_else(|e| {
            log::warn!("Failed to parse config file: {}. Using defaults.", e);
            Config::default()
        });
        Ok(config)
    } else {
        let default_config = Config::default();
        save_config(config_path, &default_config)?;
        Ok(default_config)
    }
}

pub fn save_config(config_path: &Path, config: &Config) -> AppResult<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Keep a backup of the previous file
    if config_path.exists() {
        let backup_path = config_path.with_extension("json.bak");
        if let Err(e) = fs::copy(config_path, &backup_path) {
            log::warn!("Failed to create config backup: {}", e);
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(config_path, config_str)?;

    log::info!("Configuration saved to {}", config_path.display());
    Ok(())
}

pub fn validate_config(config: &Config) -> AppResult<()> {
    if config.max_attempts == 0 || config.max_attempts > 10 {
        return Err(AppError::validation("max_attempts", "Must be between 1 and 10"));
    }

    if config.base_delay_seconds == 0 {
        return Err(AppError::validation("base_delay_seconds", "Must be greater than 0"));
    }

    if config.rate_limit_base_delay_seconds <= config.base_delay_seconds {
        return Err(AppError::validation(
            "rate_limit_base_delay_seconds",
            "Must be greater than base_delay_seconds",
        ));
    }

    if config.pre_publish_jitter_min_seconds > config.pre_publish_jitter_max_seconds {
        return Err(AppError::validation(
            "pre_publish_jitter_min_seconds",
            "Must not exceed pre_publish_jitter_max_seconds",
        ));
    }

    if config.post_publish_cooldown_min_seconds > config.post_publish_cooldown_max_seconds {
        return Err(AppError::validation(
            "post_publish_cooldown_min_seconds",
            "Must not exceed post_publish_cooldown_max_seconds",
        ));
    }

    if config.call_timeout_seconds == 0 {
        return Err(AppError::validation("call_timeout_seconds", "Must be greater than 0"));
    }

    if config.confirmation_lookback == 0 {
        return Err(AppError::validation("confirmation_lookback", "Must be greater than 0"));
    }

    if config.caption.trim().is_empty() {
        log::warn!("Caption is empty; reels will be published without a caption");
    }

    if !(config.bridge_url.starts_with("http://") || config.bridge_url.starts_with("https://")) {
        return Err(AppError::validation("bridge_url", "Must be an http(s) URL"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        validate_config(&config).unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.caption, DEFAULT_CAPTION);
        assert!(config.caption.starts_with('#'));
    }

    #[test]
    fn missing_caption_falls_back_to_default_but_blank_is_allowed() {
        let parsed: Config = serde_json::from_str(r#"{"account_username": "reels"}"#).unwrap();
        assert_eq!(parsed.caption, DEFAULT_CAPTION);

        let blank: Config = serde_json::from_str(r#"{"caption": "  "}"#).unwrap();
        validate_config(&blank).unwrap();
    }

    #[test]
    fn credentials_require_username_and_a_login_path() {
        let mut config = Config::default();
        assert!(matches!(
            config.credentials(),
            Err(AppError::ConfigurationMissing { .. })
        ));

        config.account_username = "reels".into();
        config.account_password = Some("   ".into());
        assert!(matches!(
            config.credentials(),
            Err(AppError::ConfigurationMissing { .. })
        ));

        config.manual_session_token = Some("sid".into());
        let creds = config.credentials().unwrap();
        assert_eq!(creds.password, None);
        assert_eq!(creds.manual_session_token.as_deref(), Some("sid"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = Config::default();
        config.account_username = "from-file".into();
        config
            .apply_env_overrides(lookup(&[
                ("INSTA_USERNAME", "from-env"),
                ("INSTA_PASSWORD", "pw"),
                ("REEL_MAX_ATTEMPTS", "5"),
                ("REEL_CONTENT_DIR", "/srv/clips"),
            ]))
            .unwrap();

        assert_eq!(config.account_username, "from-env");
        assert_eq!(config.account_password.as_deref(), Some("pw"));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.content_dir, PathBuf::from("/srv/clips"));
    }

    #[test]
    fn bad_numeric_override_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(lookup(&[("REEL_MAX_ATTEMPTS", "three")]))
            .unwrap_err();
        assert!(err.to_string().contains("REEL_MAX_ATTEMPTS"));
    }

    #[test]
    fn rate_limit_delay_must_exceed_base_delay() {
        let mut config = Config::default();
        config.rate_limit_base_delay_seconds = config.base_delay_seconds;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.max_attempts = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.pre_publish_jitter_min_seconds = 50;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = load_config_file(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.base_delay_seconds, 30);

        let mut edited = config.clone();
        edited.caption = "#cars".into();
        save_config(&path, &edited).unwrap();
        assert!(path.with_extension("json.bak").exists());
        assert_eq!(load_config_file(&path).unwrap().caption, "#cars");
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"account_username":"reels","max_attempts":4}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.account_username, "reels");
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.rate_limit_base_delay_seconds, 600);
    }
}
