use crate::runner::RunnerPolicy;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_FILE_NAME: &str = "engine.json";
const MIN_FILTER_TIMEOUT_MS: u64 = 50;
const MIN_CANCEL_GRACE_MS: u64 = 10;
const MIN_CAPTURED_BYTES: usize = 1024;
const MIN_WATCHDOG_INTERVAL_MS: u64 = 1;
const MAX_WATCHDOG_INTERVAL_MS: u64 = 1000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default = "default_filter_timeout_ms")]
    pub filter_timeout_ms: u64,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default = "default_max_captured_bytes")]
    pub max_captured_bytes: usize,
    #[serde(default = "default_max_retained_runs")]
    pub max_retained_runs: usize,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            filter_timeout_ms: default_filter_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            max_captured_bytes: default_max_captured_bytes(),
            max_retained_runs: default_max_retained_runs(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
        }
    }
}

impl EngineSettings {
    /// Clamps every tunable into a usable range.
    pub fn normalized(&self) -> Self {
        Self {
            schema_version: self.schema_version,
            filter_timeout_ms: self.filter_timeout_ms.max(MIN_FILTER_TIMEOUT_MS),
            cancel_grace_ms: self.cancel_grace_ms.max(MIN_CANCEL_GRACE_MS),
            max_captured_bytes: self.max_captured_bytes.max(MIN_CAPTURED_BYTES),
            max_retained_runs: self.max_retained_runs.max(1),
            watchdog_interval_ms: self
                .watchdog_interval_ms
                .clamp(MIN_WATCHDOG_INTERVAL_MS, MAX_WATCHDOG_INTERVAL_MS),
        }
    }

    pub fn filter_timeout(&self) -> Duration {
        Duration::from_millis(self.normalized().filter_timeout_ms)
    }

    pub fn to_runner_policy(&self) -> RunnerPolicy {
        let settings = self.normalized();
        RunnerPolicy {
            watchdog_interval: Duration::from_millis(settings.watchdog_interval_ms),
            cancel_grace: Duration::from_millis(settings.cancel_grace_ms),
            max_captured_bytes: settings.max_captured_bytes,
        }
    }
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE_NAME)
}

pub fn load_settings(config_dir: &Path) -> Result<EngineSettings> {
    let path = settings_path(config_dir);
    if !path.exists() {
        return Ok(EngineSettings::default());
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read engine settings file: {}", path.display()))?;
    let settings: EngineSettings = serde_json::from_str(&raw)
        .with_context(|| format!("parse engine settings file: {}", path.display()))?;
    Ok(settings)
}

pub fn save_settings(config_dir: &Path, settings: &EngineSettings) -> Result<()> {
    fs::create_dir_all(config_dir)
        .with_context(|| format!("create config dir: {}", config_dir.display()))?;

    let path = settings_path(config_dir);
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(&path, json)
        .with_context(|| format!("write engine settings file: {}", path.display()))?;
    Ok(())
}

const fn default_schema_version() -> u32 {
    1
}

const fn default_filter_timeout_ms() -> u64 {
    3000
}

const fn default_cancel_grace_ms() -> u64 {
    2000
}

const fn default_max_captured_bytes() -> usize {
    4 * 1024 * 1024
}

const fn default_max_retained_runs() -> usize {
    64
}

const fn default_watchdog_interval_ms() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "clipcmd_core_settings_test_{}_{}",
            name,
            std::process::id()
        ))
    }

    #[test]
    fn load_defaults_when_missing() {
        let dir = temp_dir("missing");
        if dir.exists() {
            let _ = fs::remove_dir_all(&dir);
        }

        let settings = load_settings(&dir).expect("load defaults");
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.filter_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = temp_dir("roundtrip");
        if dir.exists() {
            let _ = fs::remove_dir_all(&dir);
        }

        let settings = EngineSettings {
            filter_timeout_ms: 750,
            cancel_grace_ms: 400,
            max_retained_runs: 5,
            ..EngineSettings::default()
        };
        save_settings(&dir, &settings).expect("save settings");
        let loaded = load_settings(&dir).expect("load settings");
        assert_eq!(loaded, settings);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"cancel_grace_ms": 250}"#).expect("parse");
        assert_eq!(settings.cancel_grace_ms, 250);
        assert_eq!(settings.max_captured_bytes, 4 * 1024 * 1024);
        assert_eq!(settings.watchdog_interval_ms, 10);
    }

    #[test]
    fn invalid_json_reports_path() {
        let dir = temp_dir("invalid");
        fs::create_dir_all(&dir).expect("create dir");
        fs::write(settings_path(&dir), "{ nope").expect("write");

        let err = load_settings(&dir).expect_err("invalid json");
        assert!(format!("{err:#}").contains("engine.json"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn runner_policy_is_clamped() {
        let settings = EngineSettings {
            cancel_grace_ms: 0,
            max_captured_bytes: 3,
            watchdog_interval_ms: 60_000,
            ..EngineSettings::default()
        };
        let policy = settings.to_runner_policy();
        assert_eq!(policy.cancel_grace, Duration::from_millis(MIN_CANCEL_GRACE_MS));
        assert_eq!(policy.max_captured_bytes, MIN_CAPTURED_BYTES);
        assert_eq!(
            policy.watchdog_interval,
            Duration::from_millis(MAX_WATCHDOG_INTERVAL_MS)
        );
    }
}
