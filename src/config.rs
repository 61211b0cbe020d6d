//! Configuration loading from environment and runtime moderation settings.
//!
//! Process configuration (tokens, paths, ports) is read once at startup.
//! Moderation thresholds live in a `SettingsStore` that operators may change
//! while the bot runs; decisions always read a fresh snapshot.

use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BulwarkError, Result};

/// Default scheduler tick interval in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

/// Default bound on a single external action, in milliseconds.
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 10_000;

/// Longest accepted window or decay setting: one year.
pub const MAX_WINDOW_SECONDS: u64 = 366 * 24 * 60 * 60;

/// Longest timeout Discord accepts: 28 days.
pub const MAX_TIMEOUT_MINUTES: u64 = 28 * 24 * 60;

/// Main process configuration.
#[derive(Debug, Clone)]
pub struct BulwarkConfig {
    /// Discord bot token.
    pub discord_token: String,
    /// SQLite database path.
    pub database_path: String,
    /// Channel receiving moderation notices.
    pub mod_channel_id: u64,
    /// Port for the health endpoint.
    pub health_port: u16,
    /// Interval between scheduler ticks.
    pub tick_interval: Duration,
    /// Upper bound for any single executor call.
    pub action_timeout: Duration,
    /// Initial moderation settings.
    pub settings: ModerationSettings,
}

impl BulwarkConfig {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `DISCORD_TOKEN`: Discord bot token
    /// - `MOD_CHANNEL_ID`: Channel ID for moderator notices
    ///
    /// Optional environment variables:
    /// - `DATABASE_PATH` (default: `bulwark.db`)
    /// - `HEALTH_PORT` (default: 8080)
    /// - `TICK_INTERVAL_MS` (default: 1000)
    /// - `ACTION_TIMEOUT_MS` (default: 10000)
    /// - `MODERATION_SETTINGS_PATH`: JSON file with moderation settings
    pub fn from_env() -> Result<Self> {
        let discord_token = env::var("DISCORD_TOKEN")
            .map_err(|_| BulwarkError::Config("DISCORD_TOKEN not set".to_string()))?;

        let mod_channel_id = env::var("MOD_CHANNEL_ID")
            .map_err(|_| BulwarkError::Config("MOD_CHANNEL_ID not set".to_string()))?
            .parse::<u64>()
            .map_err(|_| BulwarkError::Config("MOD_CHANNEL_ID is not a valid id".to_string()))?;

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "bulwark.db".to_string());

        let health_port = parse_env_or("HEALTH_PORT", 8080u16);
        let tick_interval =
            Duration::from_millis(parse_env_or("TICK_INTERVAL_MS", DEFAULT_TICK_INTERVAL_MS));
        let action_timeout =
            Duration::from_millis(parse_env_or("ACTION_TIMEOUT_MS", DEFAULT_ACTION_TIMEOUT_MS));

        let settings = match env::var("MODERATION_SETTINGS_PATH") {
            Ok(path) => load_settings_from_file(&path)?,
            Err(_) => ModerationSettings::default(),
        };
        settings.validate()?;

        Ok(Self {
            discord_token,
            database_path,
            mod_channel_id,
            health_port,
            tick_interval,
            action_timeout,
            settings,
        })
    }
}

/// Parse an environment variable, falling back to a default when unset or invalid.
fn parse_env_or<T: std::str::FromStr>(var_name: &str, default: T) -> T {
    env::var(var_name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Load moderation settings from a JSON file.
fn load_settings_from_file(path: &str) -> Result<ModerationSettings> {
    let content = fs::read_to_string(Path::new(path))
        .map_err(|e| BulwarkError::Config(format!("Failed to read settings file: {}", e)))?;

    serde_json::from_str(&content)
        .map_err(|e| BulwarkError::Config(format!("Failed to parse settings file: {}", e)))
}

/// Operator-facing moderation thresholds and weights.
///
/// Field names follow the operator configuration keys (`SpamBasePressure`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ModerationSettings {
    /// Whether spam pressure actions run at all.
    pub spam_enabled: bool,
    /// Pressure added by every message.
    pub spam_base_pressure: f64,
    /// Pressure per embed or attachment.
    pub spam_image_pressure: f64,
    /// Pressure per character.
    pub spam_length_pressure: f64,
    /// Pressure per newline.
    pub spam_line_pressure: f64,
    /// Pressure per mention.
    pub spam_ping_pressure: f64,
    /// Pressure for repeating the previous message.
    pub spam_repeat_pressure: f64,
    /// Pressure per unusual character.
    pub spam_unusual_character_pressure: f64,
    /// Threshold above which a message is a violation.
    pub spam_max_pressure: f64,
    /// Seconds for one base pressure to decay away.
    pub spam_pressure_decay: f64,
    /// Seconds of message history deleted on violation.
    pub spam_message_delete_lookback: u64,
    /// A second violation within this many seconds of a silence escalates to a timeout.
    pub spam_silence_escalation_window: u64,
    /// Timeout length for escalated violations.
    pub spam_timeout_minutes: u64,
    /// Roles that never trigger spam actions.
    pub spam_bypass_roles: Vec<u64>,
    /// Users that never trigger spam actions.
    pub spam_bypass_users: Vec<u64>,
    /// Channels where spam actions are not taken.
    pub spam_ignored_channels: Vec<u64>,
    /// Role removed to silence a user.
    pub member_role: Option<u64>,
    /// Master switch for raid detection.
    pub raid_protection_enabled: bool,
    /// Joins within the window that count as a small raid.
    pub small_raid_size: u32,
    /// Joins within the window that count as a large raid.
    pub large_raid_size: u32,
    /// Seconds a join stays in the recent-join window.
    pub recent_join_decay: u64,
    /// Minutes before a small raid is re-checked.
    pub small_raid_decay: u64,
    /// Minutes before a large raid is re-checked.
    pub large_raid_decay: u64,
    /// Silence every new join (set automatically during large raids).
    pub auto_silence_new_joins: bool,
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self {
            spam_enabled: true,
            spam_base_pressure: 10.0,
            spam_image_pressure: 8.3,
            spam_length_pressure: 0.00625,
            spam_line_pressure: 0.714,
            spam_ping_pressure: 2.5,
            spam_repeat_pressure: 10.0,
            spam_unusual_character_pressure: 0.01,
            spam_max_pressure: 60.0,
            spam_pressure_decay: 2.5,
            spam_message_delete_lookback: 60,
            spam_silence_escalation_window: 3600,
            spam_timeout_minutes: 10,
            spam_bypass_roles: Vec::new(),
            spam_bypass_users: Vec::new(),
            spam_ignored_channels: Vec::new(),
            member_role: None,
            raid_protection_enabled: true,
            small_raid_size: 3,
            large_raid_size: 10,
            recent_join_decay: 300,
            small_raid_decay: 5,
            large_raid_decay: 30,
            auto_silence_new_joins: false,
        }
    }
}

impl ModerationSettings {
    /// Validate thresholds before they reach the engines.
    pub fn validate(&self) -> Result<()> {
        let weights = [
            ("SpamBasePressure", self.spam_base_pressure),
            ("SpamImagePressure", self.spam_image_pressure),
            ("SpamLengthPressure", self.spam_length_pressure),
            ("SpamLinePressure", self.spam_line_pressure),
            ("SpamPingPressure", self.spam_ping_pressure),
            ("SpamRepeatPressure", self.spam_repeat_pressure),
            ("SpamUnusualCharacterPressure", self.spam_unusual_character_pressure),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(BulwarkError::Config(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        if !self.spam_max_pressure.is_finite() || self.spam_max_pressure <= 0.0 {
            return Err(BulwarkError::Config(
                "SpamMaxPressure must be greater than zero".to_string(),
            ));
        }
        if !self.spam_pressure_decay.is_finite() || self.spam_pressure_decay <= 0.0 {
            return Err(BulwarkError::Config(
                "SpamPressureDecay must be greater than zero".to_string(),
            ));
        }
        let windows = [
            ("SpamMessageDeleteLookback", self.spam_message_delete_lookback),
            ("SpamSilenceEscalationWindow", self.spam_silence_escalation_window),
            ("RecentJoinDecay", self.recent_join_decay),
            ("SmallRaidDecay", self.small_raid_decay.saturating_mul(60)),
            ("LargeRaidDecay", self.large_raid_decay.saturating_mul(60)),
        ];
        for (name, seconds) in windows {
            if seconds > MAX_WINDOW_SECONDS {
                return Err(BulwarkError::Config(format!(
                    "{} must not exceed one year",
                    name
                )));
            }
        }
        if self.spam_timeout_minutes == 0 || self.spam_timeout_minutes > MAX_TIMEOUT_MINUTES {
            return Err(BulwarkError::Config(format!(
                "SpamTimeoutMinutes must be between 1 and {}, got {}",
                MAX_TIMEOUT_MINUTES, self.spam_timeout_minutes
            )));
        }

        if self.small_raid_size == 0 || self.large_raid_size == 0 {
            return Err(BulwarkError::Config(
                "raid sizes must be greater than zero".to_string(),
            ));
        }
        if self.large_raid_size < self.small_raid_size {
            return Err(BulwarkError::Config(format!(
                "LargeRaidSize ({}) must not be smaller than SmallRaidSize ({})",
                self.large_raid_size, self.small_raid_size
            )));
        }

        Ok(())
    }

    /// Pressure shed per second of silence.
    pub fn decay_per_second(&self) -> f64 {
        self.spam_base_pressure / self.spam_pressure_decay
    }
}

/// Shared, runtime-updatable moderation settings.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<ModerationSettings>>,
}

impl SettingsStore {
    pub fn new(settings: ModerationSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Current settings. Callers take a snapshot per decision.
    pub fn snapshot(&self) -> ModerationSettings {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace all settings after validating them.
    pub fn replace(&self, settings: ModerationSettings) -> Result<()> {
        settings.validate()?;
        let mut current = self
            .inner
            .write()
            .map_err(|_| BulwarkError::InternalState("settings lock poisoned".to_string()))?;
        *current = settings;
        Ok(())
    }

    /// Apply an edit; the edit is discarded if the result is invalid.
    pub fn update<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut ModerationSettings),
    {
        let mut candidate = self.snapshot();
        edit(&mut candidate);
        self.replace(candidate)
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(ModerationSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::config::{load_settings_from_file, parse_env_or, ModerationSettings, SettingsStore};

    #[test]
    fn default_settings_are_valid() {
        assert!(ModerationSettings::default().validate().is_ok());
    }

    #[test]
    fn decay_per_second_uses_base_and_decay() {
        let settings = ModerationSettings::default();
        assert!((settings.decay_per_second() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_negative_weight() {
        let settings = ModerationSettings {
            spam_ping_pressure: -1.0,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("SpamPingPressure"));
    }

    #[test]
    fn rejects_zero_decay() {
        let settings = ModerationSettings {
            spam_pressure_decay: 0.0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_inverted_raid_sizes() {
        let settings = ModerationSettings {
            small_raid_size: 10,
            large_raid_size: 3,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_windows() {
        let lookback = ModerationSettings {
            spam_message_delete_lookback: 100_000_000_000_000_000,
            ..Default::default()
        };
        let err = lookback.validate().unwrap_err();
        assert!(err.to_string().contains("SpamMessageDeleteLookback"));

        let raid_decay = ModerationSettings {
            large_raid_decay: u64::MAX,
            ..Default::default()
        };
        assert!(raid_decay.validate().is_err());

        let join_window = ModerationSettings {
            recent_join_decay: u64::MAX,
            ..Default::default()
        };
        assert!(join_window.validate().is_err());
    }

    #[test]
    fn rejects_timeout_beyond_discord_limit() {
        let settings = ModerationSettings {
            spam_timeout_minutes: 28 * 24 * 60 + 1,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let zero = ModerationSettings {
            spam_timeout_minutes: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn store_rejects_oversized_window() {
        let store = SettingsStore::default();
        assert!(store
            .update(|s| s.spam_silence_escalation_window = u64::MAX)
            .is_err());
        assert_eq!(store.snapshot().spam_silence_escalation_window, 3600);
    }

    #[test]
    fn float_weights_survive_settings_file() {
        let settings = ModerationSettings {
            spam_base_pressure: 12.113600397967595,
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).expect("serialize");
        let parsed: ModerationSettings = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.spam_base_pressure, 12.113600397967595);
    }

    #[test]
    fn store_update_applies_valid_edit() {
        let store = SettingsStore::default();
        store
            .update(|s| s.spam_max_pressure = 80.0)
            .expect("valid edit");
        assert_eq!(store.snapshot().spam_max_pressure, 80.0);
    }

    #[test]
    fn store_update_discards_invalid_edit() {
        let store = SettingsStore::default();
        assert!(store.update(|s| s.spam_max_pressure = 0.0).is_err());
        assert_eq!(store.snapshot().spam_max_pressure, 60.0);
    }

    #[test]
    fn settings_use_operator_field_names() {
        let json = serde_json::to_value(ModerationSettings::default()).expect("serialize");
        assert!(json.get("SpamBasePressure").is_some());
        assert!(json.get("SmallRaidSize").is_some());
        assert!(json.get("RecentJoinDecay").is_some());
    }

    #[test]
    fn partial_settings_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"SpamMaxPressure": 75.0, "LargeRaidSize": 20}}"#).expect("write");

        let settings =
            load_settings_from_file(file.path().to_str().expect("utf8 path")).expect("load");
        assert_eq!(settings.spam_max_pressure, 75.0);
        assert_eq!(settings.large_raid_size, 20);
        assert_eq!(settings.spam_base_pressure, 10.0);
    }

    #[test]
    fn parse_env_or_falls_back() {
        let var_name = "TEST_BULWARK_PARSE_FALLBACK_12345";
        std::env::remove_var(var_name);
        assert_eq!(parse_env_or(var_name, 42u64), 42);
    }
}
