pub mod expand;

use std::fmt;
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::device::DeviceKind;
use crate::errors::CoreError;
use crate::flow::temporal::{Timezones, Zone};

/// A named flow cache on the device, e.g. `FLOW-MONITOR` or an ACL-filtered
/// monitor such as `dat_Gi1_885011376`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorSource(String);

impl MonitorSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonitorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Router connection settings.
///
/// - `port`: defaults to 22.
/// - `auth_method`: `"password"` (default), `"key"` or `"agent"`.
/// - `device_type`: CLI flavour, selects the cache command template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// Bounds TCP connect, banner exchange, handshake and authentication.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bounds a single command's execution and output read.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            username: String::new(),
            auth_method: default_auth_method(),
            password: None,
            key_path: None,
            device_type: default_device_type(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

/// Time-series store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// PostgreSQL/TimescaleDB connection URL.
    pub url: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            table: default_table(),
            write_timeout_ms: default_write_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

/// Timezone settings. Each value is a fixed UTC offset (`UTC`, `Z`,
/// `+04:00`, `-0530`) or an IANA zone name such as `Asia/Dubai`.
///
/// - `device`: the router's clock; cache times are read in this zone.
/// - `reference`: zone whose calendar date is attached to cache times.
///   Defaults to `device`.
/// - `canonical`: zone of every persisted timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimezoneConfig {
    #[serde(default = "default_device_tz")]
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default = "default_canonical_tz")]
    pub canonical: String,
}

impl Default for TimezoneConfig {
    fn default() -> Self {
        Self {
            device: default_device_tz(),
            reference: None,
            canonical: default_canonical_tz(),
        }
    }
}

impl TimezoneConfig {
    /// Parse the configured zones.
    pub fn resolve(&self) -> Result<Timezones, CoreError> {
        let parse = |label: &str, value: &str| {
            parse_zone(value)
                .ok_or_else(|| CoreError::Config(format!("Invalid {label} timezone: '{value}'")))
        };
        let device = parse("device", &self.device)?;
        let reference = match &self.reference {
            Some(r) => parse("reference", r)?,
            None => device,
        };
        let canonical = parse("canonical", &self.canonical)?;
        Ok(Timezones {
            reference,
            device,
            canonical,
        })
    }
}

/// Complete collector configuration, constructed once at process start and
/// passed down to the scheduler and sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorConfig {
    pub device: DeviceConfig,
    pub monitors: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Number of concurrent worker slots per cycle, each with its own session.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub timezones: TimezoneConfig,
    pub store: StoreConfig,
    #[serde(default = "default_fallback_log")]
    pub fallback_log: String,
}

impl CollectorConfig {
    /// Return a copy with all `${env:...}` placeholders and `~` expanded.
    pub fn expand(mut self) -> Self {
        self.device = self.device.expand();
        self.store.url = expand::expand_env_placeholders(&self.store.url);
        self.fallback_log =
            expand::expand_tilde(&expand::expand_env_placeholders(&self.fallback_log));
        self.monitors = self
            .monitors
            .iter()
            .map(|m| expand::expand_env_placeholders(m).trim().to_string())
            .collect();
        self
    }

    /// Reject configurations the collector cannot start with.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut missing = Vec::new();
        if self.device.host.trim().is_empty() {
            missing.push("device.host");
        }
        if self.device.username.trim().is_empty() {
            missing.push("device.username");
        }
        if self.device.auth_method == "password"
            && self.device.password.as_deref().unwrap_or("").is_empty()
        {
            missing.push("device.password");
        }
        if self.store.url.trim().is_empty() {
            missing.push("store.url");
        }
        if !missing.is_empty() {
            return Err(CoreError::Config(format!(
                "Missing required settings: {}",
                missing.join(", ")
            )));
        }

        if !matches!(self.device.auth_method.as_str(), "password" | "key" | "agent") {
            return Err(CoreError::Config(format!(
                "Unknown SSH auth method: {}",
                self.device.auth_method
            )));
        }
        self.device.device_type.parse::<DeviceKind>()?;
        if self.monitors.iter().all(|m| m.trim().is_empty()) {
            return Err(CoreError::Config("No flow monitors configured".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(CoreError::Config("Poll interval must be at least 1s".into()));
        }
        if self.workers == 0 {
            return Err(CoreError::Config("Worker count must be at least 1".into()));
        }
        self.timezones.resolve()?;
        Ok(())
    }

    pub fn monitor_sources(&self) -> Vec<MonitorSource> {
        self.monitors
            .iter()
            .filter(|m| !m.trim().is_empty())
            .map(MonitorSource::new)
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl DeviceConfig {
    /// Return a copy with all `${env:...}` placeholders and `~` expanded.
    pub fn expand(mut self) -> Self {
        self.host = expand::expand_env_placeholders(&self.host);
        self.username = expand::expand_env_placeholders(&self.username);
        self.password = self.password.map(|s| expand::expand_env_placeholders(&s));
        self.key_path = self.key_path.map(|s| {
            let stripped = s.trim().trim_matches('"').trim_matches('\'');
            expand::expand_tilde(&expand::expand_env_placeholders(stripped))
        });
        self
    }
}

/// Parse a fixed offset (see [`parse_utc_offset`]) or an IANA zone name.
pub fn parse_zone(value: &str) -> Option<Zone> {
    parse_utc_offset(value)
        .map(Zone::Fixed)
        .or_else(|| value.trim().parse().ok().map(Zone::Named))
}

/// Parse a fixed UTC offset such as `UTC`, `Z`, `+04:00`, `-05:30` or `+0400`.
pub fn parse_utc_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("utc") || value.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

// --- Default value functions ---

fn default_ssh_port() -> u16 {
    22
}

fn default_auth_method() -> String {
    "password".to_string()
}

fn default_device_type() -> String {
    "cisco_ios".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_table() -> String {
    "network_flows".to_string()
}

fn default_write_timeout_ms() -> u64 {
    15_000
}

fn default_max_connections() -> u32 {
    4
}

fn default_device_tz() -> String {
    "UTC".to_string()
}

fn default_canonical_tz() -> String {
    "+04:00".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_workers() -> usize {
    1
}

fn default_fallback_log() -> String {
    "flows_log.jsonl".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> CollectorConfig {
        CollectorConfig {
            device: DeviceConfig {
                host: "192.0.2.1".into(),
                username: "netops".into(),
                password: Some("secret".into()),
                ..Default::default()
            },
            monitors: vec!["FLOW-MONITOR".into(), "dat_Gi1_885011376".into()],
            poll_interval_secs: 60,
            workers: 1,
            timezones: TimezoneConfig::default(),
            store: StoreConfig {
                url: "postgres://flows@localhost/network_db".into(),
                ..Default::default()
            },
            fallback_log: "flows_log.jsonl".into(),
        }
    }

    #[test]
    fn device_config_default() {
        let cfg = DeviceConfig::default();
        assert!(cfg.host.is_empty());
        assert_eq!(cfg.port, 22);
        assert_eq!(cfg.auth_method, "password");
        assert_eq!(cfg.device_type, "cisco_ios");
        assert_eq!(cfg.connect_timeout_ms, 20_000);
        assert_eq!(cfg.command_timeout_ms, 30_000);
    }

    #[test]
    fn store_config_default() {
        let cfg = StoreConfig::default();
        assert!(cfg.url.is_empty());
        assert_eq!(cfg.table, "network_flows");
        assert_eq!(cfg.write_timeout_ms, 15_000);
    }

    #[test]
    fn minimal_json_fills_defaults() {
        let json = serde_json::json!({
            "device": { "host": "r1", "username": "u", "password": "p" },
            "monitors": ["FLOW-MONITOR"],
            "store": { "url": "postgres://localhost/db" }
        });
        let cfg: CollectorConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.poll_interval_secs, 60);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.fallback_log, "flows_log.jsonl");
        assert_eq!(cfg.timezones.device, "UTC");
        assert_eq!(cfg.timezones.canonical, "+04:00");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::json!({
            "device": {
                "host": "r1", "username": "u", "authMethod": "agent",
                "deviceType": "cisco_xe", "commandTimeoutMs": 5000
            },
            "monitors": ["M"],
            "pollIntervalSecs": 10,
            "store": { "url": "postgres://x", "writeTimeoutMs": 1000 },
            "fallbackLog": "/var/lib/flowtap/fallback.jsonl"
        });
        let cfg: CollectorConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.device.auth_method, "agent");
        assert_eq!(cfg.device.command_timeout_ms, 5000);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(10));
        assert_eq!(cfg.store.write_timeout_ms, 1000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_reports_all_missing_connection_params() {
        let mut cfg = valid_config();
        cfg.device.host.clear();
        cfg.device.password = None;
        cfg.store.url.clear();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("device.host"));
        assert!(err.contains("device.password"));
        assert!(err.contains("store.url"));
    }

    #[test]
    fn validate_key_auth_needs_no_password() {
        let mut cfg = valid_config();
        cfg.device.auth_method = "key".into();
        cfg.device.password = None;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = valid_config();
        cfg.monitors = vec!["  ".into()];
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.poll_interval_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.device.device_type = "juniper_junos".into();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.timezones.canonical = "Mars/Olympus_Mons".into();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.device.auth_method = "kerberos".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn monitor_sources_skip_blank_entries() {
        let mut cfg = valid_config();
        cfg.monitors.push(String::new());
        let names: Vec<String> = cfg
            .monitor_sources()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, vec!["FLOW-MONITOR", "dat_Gi1_885011376"]);
    }

    #[test]
    fn expand_resolves_env_placeholders() {
        std::env::set_var("FLOWTAP_CFG_TEST_PASSWORD", "hunter2");
        let mut cfg = valid_config();
        cfg.device.password = Some("${env:FLOWTAP_CFG_TEST_PASSWORD}".into());
        cfg.monitors = vec![" FLOW-MONITOR ".into()];
        let cfg = cfg.expand();
        assert_eq!(cfg.device.password.as_deref(), Some("hunter2"));
        assert_eq!(cfg.monitors, vec!["FLOW-MONITOR"]);
    }

    #[test]
    fn timezones_reference_defaults_to_device() {
        let tz = TimezoneConfig {
            device: "+02:00".into(),
            reference: None,
            canonical: "UTC".into(),
        }
        .resolve()
        .unwrap();
        assert_eq!(tz.reference, tz.device);
        assert_eq!(tz.device, Zone::Fixed(FixedOffset::east_opt(7200).unwrap()));
        assert_eq!(tz.canonical, Zone::utc());
    }

    #[test]
    fn timezones_accept_iana_names() {
        let tz = TimezoneConfig {
            device: "Europe/Berlin".into(),
            reference: Some("UTC".into()),
            canonical: " Asia/Dubai ".into(),
        }
        .resolve()
        .unwrap();
        assert_eq!(tz.device, Zone::Named(chrono_tz::Europe::Berlin));
        assert_eq!(tz.reference, Zone::utc());
        assert_eq!(tz.canonical, Zone::Named(chrono_tz::Asia::Dubai));
    }

    #[test]
    fn zone_forms() {
        assert_eq!(
            parse_zone("+04:00"),
            Some(Zone::Fixed(FixedOffset::east_opt(14_400).unwrap()))
        );
        assert_eq!(parse_zone("utc"), Some(Zone::utc()));
        assert_eq!(
            parse_zone("America/New_York"),
            Some(Zone::Named(chrono_tz::America::New_York))
        );
        assert_eq!(parse_zone("Nowhere/Special"), None);
        assert_eq!(parse_zone(""), None);
    }

    #[test]
    fn utc_offset_forms() {
        assert_eq!(parse_utc_offset("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_utc_offset("z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_utc_offset("+04:00").unwrap().local_minus_utc(), 14_400);
        assert_eq!(parse_utc_offset("-0530").unwrap().local_minus_utc(), -19_800);
        assert!(parse_utc_offset("+4").is_none());
        assert!(parse_utc_offset("04:00").is_none());
        assert!(parse_utc_offset("+25:00").is_none());
        assert!(parse_utc_offset("").is_none());
    }
}
