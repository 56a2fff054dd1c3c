use chrono::Duration;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ids::{ChatId, UserId};

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "festdesk", about = "Festival assistant bot with a support desk")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind the monitoring endpoint to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind the monitoring endpoint to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub telegram: TelegramConfig,
    pub staff: StaffConfig,
    pub channels: ChannelsConfig,
    pub smtp: SmtpConfig,
    pub limits: LimitsConfig,
    pub support: SupportConfig,
    pub notifications: NotificationsConfig,
    pub schedule: ScheduleConfig,
    pub festival: FestivalConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub api_base: String,
    /// Long-poll timeout for getUpdates
    pub poll_timeout_secs: u64,
}

/// Who may answer tickets
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct StaffConfig {
    pub admin_ids: Vec<UserId>,
    pub support_staff_ids: Vec<UserId>,
}

impl StaffConfig {
    pub fn is_admin(&self, user: UserId) -> bool {
        self.admin_ids.contains(&user)
    }

    pub fn is_support_staff(&self, user: UserId) -> bool {
        self.support_staff_ids.contains(&user)
    }

    pub fn is_staff(&self, user: UserId) -> bool {
        self.is_admin(user) || self.is_support_staff(user)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ChannelsConfig {
    pub support_group_id: Option<ChatId>,
    /// Open a forum topic per ticket instead of posting flat
    pub support_group_topics: bool,
    pub feedback_channel_id: Option<ChatId>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SmtpConfig {
    pub server: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub support_email: Option<String>,
}

impl SmtpConfig {
    pub fn is_configured(&self) -> bool {
        self.server.is_some()
            && self.user.is_some()
            && self.password.is_some()
            && self.support_email.is_some()
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub cooldown_secs: i64,
    pub per_hour: i64,
    pub per_day: i64,
    pub hour_block_secs: i64,
    pub day_block_secs: i64,
}

impl LimitsConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs)
    }

    pub fn hour_block(&self) -> Duration {
        Duration::seconds(self.hour_block_secs)
    }

    pub fn day_block(&self) -> Duration {
        Duration::seconds(self.day_block_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SupportConfig {
    pub sla_hours: i64,
    pub auto_close_days: i64,
    /// Messages shown when resuming an open ticket
    pub summary_messages: usize,
    pub history_page: usize,
}

impl SupportConfig {
    pub fn sla(&self) -> Duration {
        Duration::hours(self.sla_hours)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Alerts of one kind a single admin receives per hour
    pub per_admin_hourly: i64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ScheduleConfig {
    pub health_secs: u64,
    pub sla_scan_secs: u64,
    pub auto_close_secs: u64,
    pub backup_secs: u64,
    pub backup_keep: usize,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FestivalConfig {
    pub name: String,
    /// "lat,lon" of the festival grounds
    pub coordinates: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: "https://api.telegram.org".to_string(),
            poll_timeout_secs: 30,
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            support_group_id: None,
            support_group_topics: true,
            feedback_channel_id: None,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: 587,
            user: None,
            password: None,
            support_email: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 5,
            per_hour: 20,
            per_day: 100,
            hour_block_secs: 3600,
            day_block_secs: 86400,
        }
    }
}

impl Default for SupportConfig {
    fn default() -> Self {
        Self {
            sla_hours: 2,
            auto_close_days: 7,
            summary_messages: 5,
            history_page: 50,
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            per_admin_hourly: 5,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            health_secs: 300,
            sla_scan_secs: 900,
            auto_close_secs: 3600,
            backup_secs: 86400,
            backup_keep: 10,
        }
    }
}

impl Default for FestivalConfig {
    fn default() -> Self {
        Self {
            name: "Festival".to_string(),
            coordinates: None,
        }
    }
}

/// Parse a "lat,lon" pair
pub fn parse_coordinates(raw: &str) -> Option<(f64, f64)> {
    let (lat, lon) = raw.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    Some((lat, lon))
}

fn parse_id_list(raw: &str) -> Result<Vec<UserId>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i64>().map(UserId).map_err(|_| s.to_string()))
        .collect()
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        Self::load_with_env(cli, |key| std::env::var(key).ok())
    }

    /// Layered load: file, then environment, then CLI flags
    pub fn load_with_env<F>(cli: &Cli, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = Self::data_dir(cli);
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join("config.toml"));

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env(env)?;

        // CLI overrides
        if let Some(ref host) = cli.host {
            config.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            config.server.port = port;
        }

        if config.database.path.is_none() {
            config.database.path = Some(data_dir.join("festdesk.db"));
        }

        Ok(config)
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut bad = Vec::new();

        if let Some(token) = env("BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(raw) = env("ADMIN_IDS") {
            match parse_id_list(&raw) {
                Ok(ids) => self.staff.admin_ids = ids,
                Err(v) => bad.push(format!("ADMIN_IDS: '{v}' is not a numeric id")),
            }
        }
        if let Some(raw) = env("SUPPORT_STAFF_IDS") {
            match parse_id_list(&raw) {
                Ok(ids) => self.staff.support_staff_ids = ids,
                Err(v) => bad.push(format!("SUPPORT_STAFF_IDS: '{v}' is not a numeric id")),
            }
        }
        for (key, slot) in [
            ("SUPPORT_GROUP_ID", &mut self.channels.support_group_id),
            ("FEEDBACK_CHANNEL_ID", &mut self.channels.feedback_channel_id),
        ] {
            if let Some(raw) = env(key) {
                match raw.trim().parse::<i64>() {
                    Ok(id) => *slot = Some(ChatId(id)),
                    Err(_) => bad.push(format!("{key}: '{raw}' is not a chat id")),
                }
            }
        }
        if let Some(raw) = env("SUPPORT_GROUP_TOPICS") {
            self.channels.support_group_topics =
                matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(server) = env("SMTP_SERVER") {
            self.smtp.server = Some(server);
        }
        if let Some(raw) = env("SMTP_PORT") {
            match raw.trim().parse() {
                Ok(port) => self.smtp.port = port,
                Err(_) => bad.push(format!("SMTP_PORT: '{raw}' is not a port")),
            }
        }
        if let Some(user) = env("EMAIL_USER") {
            self.smtp.user = Some(user);
        }
        if let Some(password) = env("EMAIL_PASSWORD") {
            self.smtp.password = Some(password);
        }
        if let Some(email) = env("SUPPORT_EMAIL") {
            self.smtp.support_email = Some(email);
        }
        if let Some(coords) = env("FESTIVAL_COORDINATES") {
            self.festival.coordinates = Some(coords);
        }
        if let Some(path) = env("DATABASE_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }

        if bad.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(bad))
        }
    }

    /// Checks everything the bot cannot run without. Reports all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.telegram.bot_token.trim().is_empty() {
            problems.push("bot token (BOT_TOKEN) is empty".to_string());
        }
        if self
            .database
            .path
            .as_deref()
            .map_or(true, |p| p.as_os_str().is_empty())
        {
            problems.push("database path (DATABASE_PATH) is empty".to_string());
        }
        if self.staff.admin_ids.is_empty() {
            problems.push("at least one admin id (ADMIN_IDS) is required".to_string());
        }
        for (name, id) in [
            ("support group id", self.channels.support_group_id),
            ("feedback channel id", self.channels.feedback_channel_id),
        ] {
            if let Some(id) = id {
                if id.get() >= 0 {
                    problems.push(format!("{name} {id} must be a negative chat id"));
                }
            }
        }
        if self.smtp.user.is_some() && self.smtp.password.as_deref().map_or(true, str::is_empty) {
            problems.push("EMAIL_PASSWORD is required when EMAIL_USER is set".to_string());
        }
        if let Some(coords) = &self.festival.coordinates {
            if parse_coordinates(coords).is_none() {
                problems.push(format!("coordinates '{coords}' are not a lat,lon pair"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn data_dir(cli: &Cli) -> PathBuf {
        cli.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".festdesk")
        })
    }

    pub fn db_path(&self) -> &Path {
        self.database
            .path
            .as_deref()
            .unwrap_or_else(|| Path::new("festdesk.db"))
    }

    pub fn backups_path(data_dir: &Path) -> PathBuf {
        data_dir.join("backups")
    }
}
