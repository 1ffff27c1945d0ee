use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::file::KB;
use crate::media::SessionContext;
use crate::mtp::{
    MAX_PARALLEL_BYTES_PER_SESSION, MTP_PART_TABLE, MtpLimits, UPLOAD_SESSIONS_COUNT,
    USE_BIG_FILES_FROM,
};
use crate::uploader::DEFAULT_IDLE_TEARDOWN;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploaderSettings {
    pub version: u32,
    #[serde(default)]
    pub mtp: MtpSettings,
    #[serde(default)]
    pub web: WebSettings,
    #[serde(default)]
    pub timers: Timers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtpSettings {
    pub sessions: u32,
    pub max_in_flight_per_session: u32,
    pub big_file_threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSettings {
    pub base_url: String,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub auth_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timers {
    pub send_interval_ms: u64,
    pub idle_teardown_ms: u64,
}

impl Default for MtpSettings {
    fn default() -> Self {
        Self {
            sessions: UPLOAD_SESSIONS_COUNT as u32,
            max_in_flight_per_session: MAX_PARALLEL_BYTES_PER_SESSION as u32,
            big_file_threshold: USE_BIG_FILES_FROM,
        }
    }
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            base_url: "https://upload.example.org".to_string(),
            user_id: 0,
            auth_token: String::new(),
        }
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            send_interval_ms: 10,
            idle_teardown_ms: DEFAULT_IDLE_TEARDOWN.as_millis() as u64,
        }
    }
}

impl Default for UploaderSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            mtp: MtpSettings::default(),
            web: WebSettings::default(),
            timers: Timers::default(),
        }
    }
}

impl MtpSettings {
    pub fn limits(&self) -> MtpLimits {
        MtpLimits {
            sessions: self.sessions as usize,
            max_in_flight_per_session: self.max_in_flight_per_session as usize,
            big_file_threshold: self.big_file_threshold,
        }
    }
}

impl WebSettings {
    pub fn session(&self) -> SessionContext {
        SessionContext::new(self.user_id, self.auth_token.clone())
    }
}

impl Timers {
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn idle_teardown(&self) -> Duration {
        Duration::from_millis(self.idle_teardown_ms)
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("uploader.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<UploaderSettings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(UploaderSettings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;
    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<UploaderSettings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<UploaderSettings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings version")),
    }
}

pub fn to_toml(settings: &UploaderSettings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn validate_settings(settings: &UploaderSettings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    if settings.mtp.sessions == 0 {
        return Err(Error::InvalidConfig {
            message: "mtp.sessions must be >= 1".to_string(),
        });
    }
    // A lane must be able to hold at least one part of the largest tier.
    let largest = MTP_PART_TABLE.largest_part_size();
    if (settings.mtp.max_in_flight_per_session as usize) < largest {
        return Err(Error::InvalidConfig {
            message: format!(
                "mtp.max_in_flight_per_session must be >= {} KiB",
                largest / KB
            ),
        });
    }
    if settings.mtp.big_file_threshold == 0 {
        return Err(Error::InvalidConfig {
            message: "mtp.big_file_threshold must be > 0".to_string(),
        });
    }

    let base_url = settings.web.base_url.trim();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(Error::InvalidConfig {
            message: "web.base_url must start with http:// or https://".to_string(),
        });
    }

    if settings.timers.send_interval_ms == 0 || settings.timers.idle_teardown_ms == 0 {
        return Err(Error::InvalidConfig {
            message: "timers must be > 0".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_match_protocol_constants() {
        let settings = UploaderSettings::default();
        validate_settings(&settings).unwrap();
        assert_eq!(settings.mtp.limits(), MtpLimits::default());
        assert_eq!(settings.timers.idle_teardown(), DEFAULT_IDLE_TEARDOWN);
    }

    #[test]
    fn configured_threshold_moves_the_big_file_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            config_path(dir.path()),
            "version = 1\n[mtp]\nsessions = 4\nmax_in_flight_per_session = 524288\nbig_file_threshold = 1048576\n",
        )
        .unwrap();

        let limits = load_settings(dir.path()).unwrap().mtp.limits();
        assert_eq!(limits.max_in_flight(), 4 * 524288);
        assert!(!limits.is_big(1048576));
        assert!(limits.is_big(1048577));
        assert!(!MtpLimits::default().is_big(1048577));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let settings = parse_settings(
            r#"
version = 1

[web]
base_url = "http://localhost:8080/api"
user_id = 42
auth_token = "secret"
"#,
        )
        .unwrap();
        assert_eq!(settings.mtp, MtpSettings::default());
        assert_eq!(settings.timers, Timers::default());
        assert_eq!(settings.web.session(), SessionContext::new(42, "secret"));
    }

    #[test]
    fn unknown_or_missing_version_is_rejected() {
        let err = parse_settings("version = 7").unwrap_err();
        assert!(err.to_string().contains("unsupported settings schema version"));
        assert!(parse_settings("[timers]\nsend_interval_ms = 5").is_err());
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut settings = UploaderSettings::default();
        settings.mtp.sessions = 0;
        assert!(validate_settings(&settings).is_err());

        let mut settings = UploaderSettings::default();
        settings.mtp.max_in_flight_per_session = 64 * KB as u32;
        assert!(validate_settings(&settings).is_err());

        let mut settings = UploaderSettings::default();
        settings.web.base_url = "ftp://files".to_string();
        assert!(validate_settings(&settings).is_err());

        let mut settings = UploaderSettings::default();
        settings.timers.idle_teardown_ms = 0;
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn load_reads_file_or_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            load_settings(dir.path()).unwrap(),
            UploaderSettings::default()
        );

        let mut settings = UploaderSettings::default();
        settings.mtp.sessions = 4;
        std::fs::write(config_path(dir.path()), to_toml(&settings).unwrap()).unwrap();
        assert_eq!(load_settings(dir.path()).unwrap().mtp.sessions, 4);

        std::fs::write(
            config_path(dir.path()),
            "version = 1\n[timers]\nsend_interval_ms = 0\nidle_teardown_ms = 5\n",
        )
        .unwrap();
        assert!(matches!(
            load_settings(dir.path()),
            Err(Error::InvalidConfig { .. })
        ));
    }
}
