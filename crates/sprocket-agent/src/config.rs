use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Runtime configuration resolved from the environment and an optional
/// profile file. Environment variables always win over file values.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    pub blob_url: String,
    pub token_id: Option<String>,
    pub token_secret: Option<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileConfig {
    #[serde(default)]
    server_url: Option<String>,
    #[serde(default)]
    blob_url: Option<String>,
    #[serde(default)]
    token_id: Option<String>,
    #[serde(default)]
    token_secret: Option<String>,
    #[serde(
        default,
        deserialize_with = "sprocket_helpers::de::deserialize_optional_duration"
    )]
    heartbeat_interval: Option<Duration>,
    #[serde(
        default,
        deserialize_with = "sprocket_helpers::de::deserialize_optional_duration"
    )]
    heartbeat_timeout: Option<Duration>,
    #[serde(
        default,
        deserialize_with = "sprocket_helpers::de::deserialize_optional_duration"
    )]
    connect_timeout: Option<Duration>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let profile = resolve_profile()?;

        let server_url = non_empty_env("SERVER_URL")
            .or(profile.server_url)
            .context("no control plane endpoint (SERVER_URL or profile `server_url`)")?;
        let blob_url =
            non_empty_env("BLOB_URL").or(profile.blob_url).unwrap_or_else(|| server_url.clone());

        let config = Self {
            server_url: server_url.trim().to_string(),
            blob_url: blob_url.trim().to_string(),
            token_id: non_empty_env("TOKEN_ID").or(profile.token_id),
            token_secret: non_empty_env("TOKEN_SECRET").or(profile.token_secret),
            heartbeat_interval: profile
                .heartbeat_interval
                .unwrap_or(default_heartbeat_interval()),
            heartbeat_timeout: profile
                .heartbeat_timeout
                .unwrap_or(default_heartbeat_timeout()),
            connect_timeout: profile
                .connect_timeout
                .unwrap_or(default_connect_timeout()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            bail!("config `server_url` is empty");
        }
        if self.token_id.is_some() != self.token_secret.is_some() {
            bail!("TOKEN_ID and TOKEN_SECRET must be set together");
        }
        if self.heartbeat_interval < self.heartbeat_timeout {
            bail!(
                "heartbeat interval {} shorter than heartbeat timeout {}",
                self.heartbeat_interval.as_secs_f64(),
                self.heartbeat_timeout.as_secs_f64()
            );
        }
        Ok(())
    }
}

/// Loads the profile named by `PROFILE` (default `default`) from the
/// config file, if one exists. A missing file is not an error; a missing
/// named profile in an existing file is.
fn resolve_profile() -> Result<ProfileConfig> {
    let Some(config_path) = resolve_config_path() else {
        return Ok(ProfileConfig::default());
    };

    let profiles = load_profiles_yaml(&config_path)?;
    let name =
        non_empty_env("PROFILE").unwrap_or_else(|| "default".to_string());

    match profiles.get(&name) {
        Some(profile) => Ok(profile.clone()),
        None if name == "default" => Ok(ProfileConfig::default()),
        None => bail!(
            "profile `{name}` not found in {}",
            config_path.display()
        ),
    }
}

fn load_profiles_yaml(
    path: &Path,
) -> Result<HashMap<String, ProfileConfig>> {
    let raw = std::fs::read(path).with_context(|| {
        format!("failed to read config file {}", path.display())
    })?;
    serde_yaml::from_slice(&raw).with_context(|| {
        format!("failed to parse YAML config {}", path.display())
    })
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    if let Some(home) = non_empty_env("HOME") {
        let home_yaml = PathBuf::from(&home).join(".sprocket.yaml");
        if home_yaml.exists() {
            return Some(home_yaml);
        }
    }

    None
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_file_parses_durations() {
        let raw = r#"
default:
  server_url: "127.0.0.1:7000"
  token_id: "tk-1"
  token_secret: "ts-1"
  heartbeat_interval: "20s"
staging:
  server_url: "127.0.0.1:7001"
"#;
        let profiles: HashMap<String, ProfileConfig> =
            serde_yaml::from_str(raw).unwrap();
        let default = &profiles["default"];
        assert_eq!(default.server_url.as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(
            default.heartbeat_interval,
            Some(Duration::from_secs(20))
        );
        assert!(profiles["staging"].token_id.is_none());
    }

    #[test]
    fn mismatched_credentials_rejected() {
        let config = Config {
            server_url: "127.0.0.1:7000".to_string(),
            blob_url: "127.0.0.1:7000".to_string(),
            token_id: Some("tk-1".to_string()),
            token_secret: None,
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            connect_timeout: default_connect_timeout(),
        };
        assert!(config.validate().is_err());
    }
}
