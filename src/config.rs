use reqwest::Url;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::ConfigError;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// On-disk layout of the JSON config file. Every key is optional here so
/// that command line / environment values can fill the gaps.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api_check_email_url: Option<String>,
    api_forward_params_url: Option<String>,
    request_timeout_secs: Option<u64>,
}

/// Validated endpoints handed to the policy client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    pub check_email_url: Url,
    pub forward_params_url: Url,
    pub request_timeout: Duration,
}

/// Values given on the command line or through the environment. They win
/// over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub check_email_url: Option<String>,
    pub forward_params_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: Option<PathBuf>,
    overrides: Overrides,
}

impl ConfigSource {
    pub fn new(path: Option<PathBuf>, overrides: Overrides) -> Self {
        Self { path, overrides }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> Result<PolicyConfig, ConfigError> {
        let file = match &self.path {
            Some(path) => read_file(path)?,
            None => FileConfig::default(),
        };

        let check_email_url = self
            .overrides
            .check_email_url
            .clone()
            .or(file.api_check_email_url);
        let forward_params_url = self
            .overrides
            .forward_params_url
            .clone()
            .or(file.api_forward_params_url);
        let timeout_secs = self
            .overrides
            .request_timeout_secs
            .or(file.request_timeout_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        Ok(PolicyConfig {
            check_email_url: parse_url("api_check_email_url", check_email_url)?,
            forward_params_url: parse_url("api_forward_params_url", forward_params_url)?,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }

    fn modified(&self) -> Option<SystemTime> {
        let path = self.path.as_ref()?;
        fs::metadata(path).and_then(|meta| meta.modified()).ok()
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_url(key: &'static str, value: Option<String>) -> Result<Url, ConfigError> {
    let value = value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingUrl(key))?;

    match Url::parse(value.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
        _ => Err(ConfigError::InvalidUrl { key, value }),
    }
}

/// Poll the config file and publish every valid change on `tx`.
///
/// An edit that fails validation is logged and the running configuration is
/// kept. Returns `None` when there is no file to watch.
pub fn spawn_reloader(
    source: ConfigSource,
    tx: watch::Sender<PolicyConfig>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    let path = source.path()?.to_path_buf();
    info!(path = ?path, interval_secs = interval.as_secs(), "Watching config file for changes");

    Some(tokio::spawn(async move {
        let mut last_modified = source.modified();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if reload_if_changed(&source, &tx, &mut last_modified) {
                info!(path = ?path, "Config reloaded");
            }
        }
    }))
}

fn reload_if_changed(
    source: &ConfigSource,
    tx: &watch::Sender<PolicyConfig>,
    last_modified: &mut Option<SystemTime>,
) -> bool {
    let modified = source.modified();
    if modified == *last_modified {
        return false;
    }
    *last_modified = modified;

    match source.load() {
        Ok(config) => {
            debug!(?config, "Config file changed");
            tx.send_if_modified(|current| {
                if *current == config {
                    false
                } else {
                    *current = config;
                    true
                }
            })
        }
        Err(e) => {
            error!(error = %e, "Ignoring invalid config change, keeping previous settings");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"{
                "api_check_email_url": "http://api.local/check",
                "api_forward_params_url": "http://api.local/forward",
                "request_timeout_secs": 5
            }"#,
        );
        let source = ConfigSource::new(Some(file.path().to_path_buf()), Overrides::default());
        let config = source.load().unwrap();

        assert_eq!(config.check_email_url.as_str(), "http://api.local/check");
        assert_eq!(config.forward_params_url.as_str(), "http://api.local/forward");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides_win_over_file() {
        let file = write_config(
            r#"{
                "api_check_email_url": "http://api.local/check",
                "api_forward_params_url": "http://api.local/forward"
            }"#,
        );
        let overrides = Overrides {
            check_email_url: Some("https://other.local/exists".to_string()),
            ..Overrides::default()
        };
        let config = ConfigSource::new(Some(file.path().to_path_buf()), overrides)
            .load()
            .unwrap();

        assert_eq!(config.check_email_url.as_str(), "https://other.local/exists");
        assert_eq!(config.forward_params_url.as_str(), "http://api.local/forward");
        assert_eq!(
            config.request_timeout,
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_missing_url_is_fatal() {
        let overrides = Overrides {
            check_email_url: Some("http://api.local/check".to_string()),
            ..Overrides::default()
        };
        let err = ConfigSource::new(None, overrides).load().unwrap_err();

        assert!(matches!(err, ConfigError::MissingUrl("api_forward_params_url")));
    }

    #[test]
    fn test_blank_url_counts_as_missing() {
        let overrides = Overrides {
            check_email_url: Some("  ".to_string()),
            forward_params_url: Some("http://api.local/forward".to_string()),
            request_timeout_secs: None,
        };
        let err = ConfigSource::new(None, overrides).load().unwrap_err();

        assert!(matches!(err, ConfigError::MissingUrl("api_check_email_url")));
    }

    #[test]
    fn test_non_http_url_rejected() {
        let overrides = Overrides {
            check_email_url: Some("ftp://api.local/check".to_string()),
            forward_params_url: Some("http://api.local/forward".to_string()),
            request_timeout_secs: None,
        };
        let err = ConfigSource::new(None, overrides).load().unwrap_err();

        assert!(matches!(err, ConfigError::InvalidUrl { key: "api_check_email_url", .. }));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let file = write_config(r#"{ "api_check_email": "http://api.local/check" }"#);
        let err = ConfigSource::new(Some(file.path().to_path_buf()), Overrides::default())
            .load()
            .unwrap_err();

        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_invalid_reload_keeps_previous_config() {
        let file = write_config(
            r#"{
                "api_check_email_url": "http://api.local/check",
                "api_forward_params_url": "http://api.local/forward"
            }"#,
        );
        let source = ConfigSource::new(Some(file.path().to_path_buf()), Overrides::default());
        let initial = source.load().unwrap();
        let (tx, rx) = watch::channel(initial.clone());

        fs::write(file.path(), r#"{ "api_check_email_url": "http://api.local/check" }"#).unwrap();
        let mut last_modified = None;

        assert!(!reload_if_changed(&source, &tx, &mut last_modified));
        assert_eq!(*rx.borrow(), initial);
    }

    #[test]
    fn test_valid_reload_publishes_new_config() {
        let file = write_config(
            r#"{
                "api_check_email_url": "http://api.local/check",
                "api_forward_params_url": "http://api.local/forward"
            }"#,
        );
        let source = ConfigSource::new(Some(file.path().to_path_buf()), Overrides::default());
        let (tx, rx) = watch::channel(source.load().unwrap());

        fs::write(
            file.path(),
            r#"{
                "api_check_email_url": "http://api.local/v2/check",
                "api_forward_params_url": "http://api.local/forward"
            }"#,
        )
        .unwrap();
        let mut last_modified = None;

        assert!(reload_if_changed(&source, &tx, &mut last_modified));
        assert_eq!(rx.borrow().check_email_url.as_str(), "http://api.local/v2/check");
    }
}
