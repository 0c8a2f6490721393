/*
 * DPIS Line Assistant - LINE registration and AI relay gateway
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use serde::Deserialize;

/// Env var naming the TOML config file.
pub const CONFIG_PATH_VAR: &str = "DPISLINE_CONFIG";

/// Prefix for env overrides, e.g. `DPISLINE_AI__MODEL=other-model`.
pub const ENV_PREFIX: &str = "DPISLINE";

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub line: LineConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    /// Profile store. When absent the gateway keeps profiles in memory.
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServiceConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            env: default_env(),
            port: default_port(),
        }
    }
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_port() -> u16 {
    10000
}

#[derive(Deserialize, Clone, Debug)]
pub struct LineConfig {
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,
    #[serde(default = "default_channel_secret_env")]
    pub channel_secret_env: String,
    #[serde(default = "default_line_api_base")]
    pub api_base: String,
    #[serde(default = "default_line_timeout")]
    pub timeout_seconds: u64,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            access_token_env: default_access_token_env(),
            channel_secret_env: default_channel_secret_env(),
            api_base: default_line_api_base(),
            timeout_seconds: default_line_timeout(),
        }
    }
}

fn default_access_token_env() -> String {
    "LINE_CHANNEL_ACCESS_TOKEN".to_string()
}

fn default_channel_secret_env() -> String {
    "LINE_CHANNEL_SECRET".to_string()
}

fn default_line_api_base() -> String {
    "https://api.line.me".to_string()
}

fn default_line_timeout() -> u64 {
    10
}

#[derive(Deserialize, Clone, Debug)]
pub struct AiConfig {
    /// Fallback base URL when the env var named by `base_url_env` is unset.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_base_url_env")]
    pub base_url_env: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_ai_timeout")]
    pub timeout_seconds: u64,
    /// Tried in order; the next one is used only on 403/404.
    #[serde(default = "default_completion_paths")]
    pub completion_paths: Vec<String>,
    /// `{department}` is replaced with the user's department.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Substituted for `{department}` when the profile has none.
    #[serde(default = "default_audience")]
    pub default_audience: String,
    #[serde(default = "default_apology")]
    pub apology: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            base_url_env: default_base_url_env(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_seconds: default_ai_timeout(),
            completion_paths: default_completion_paths(),
            system_prompt: default_system_prompt(),
            default_audience: default_audience(),
            apology: default_apology(),
        }
    }
}

fn default_base_url_env() -> String {
    "OPENAI_API_BASE_URL".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "hrms-dpis6".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_ai_timeout() -> u64 {
    30
}

fn default_completion_paths() -> Vec<String> {
    vec!["/api/v1/chat/completions".to_string()]
}

fn default_system_prompt() -> String {
    "คุณคือผู้ช่วยผู้เชี่ยวชาญด้านโปรแกรม DPIS6 ผู้ใช้มาจากกรม/ส่วนราชการ: {department} \
     กรุณาตอบคำถามอย่างกระชับและเป็นมิตร"
        .to_string()
}

fn default_audience() -> String {
    "ผู้ใช้ทั่วไป".to_string()
}

fn default_apology() -> String {
    "ขออภัยค่ะ ระบบ AI ขัดข้องชั่วคราว กรุณาลองใหม่อีกครั้งในภายหลังค่ะ".to_string()
}

/// Short button label for a department whose full name is too long.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DepartmentAlias {
    pub name: String,
    pub label: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RegistrationConfig {
    /// Marks a quick-reply department selection.
    #[serde(default = "default_confirm_prefix")]
    pub confirm_prefix: String,
    #[serde(default = "default_min_name_chars")]
    pub min_name_chars: usize,
    #[serde(default = "default_max_matches")]
    pub max_matches: usize,
    #[serde(default = "default_similarity_cutoff")]
    pub similarity_cutoff: f64,
    #[serde(default = "default_max_options")]
    pub max_options: usize,
    #[serde(default = "default_departments")]
    pub departments: Vec<String>,
    #[serde(default = "default_aliases")]
    pub aliases: Vec<DepartmentAlias>,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            confirm_prefix: default_confirm_prefix(),
            min_name_chars: default_min_name_chars(),
            max_matches: default_max_matches(),
            similarity_cutoff: default_similarity_cutoff(),
            max_options: default_max_options(),
            departments: default_departments(),
            aliases: default_aliases(),
        }
    }
}

fn default_confirm_prefix() -> String {
    "DEPT_CONFIRM:".to_string()
}

fn default_min_name_chars() -> usize {
    4
}

fn default_max_matches() -> usize {
    5
}

fn default_similarity_cutoff() -> f64 {
    0.3
}

/// LINE accepts at most 13 quick-reply items per message.
pub const MAX_QUICK_REPLY_ITEMS: usize = 13;

fn default_max_options() -> usize {
    MAX_QUICK_REPLY_ITEMS
}

fn default_departments() -> Vec<String> {
    [
        "สำนักงานปลัดกระทรวงการคลัง",
        "กรมสรรพากร",
        "กรมศุลกากร",
        "กรมธนารักษ์",
        "กรมควบคุมโรค",
        "กรมส่งเสริมการเกษตร",
        "กรมปศุสัตว์",
        "สำนักงาน ก.พ.",
        "สำนักเลขาธิการคณะรัฐมนตรี",
        "สำนักงบประมาณ",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_aliases() -> Vec<DepartmentAlias> {
    [
        ("สำนักงานปลัดกระทรวงการคลัง", "ปลัดกระทรวงการคลัง"),
        (
            "สำนักงานคณะกรรมการกำกับและส่งเสริมการประกอบธุรกิจประกันภัย",
            "คปภ.",
        ),
        (
            "สำนักงานคณะกรรมการส่งเสริมสวัสดิการและสวัสดิภาพครูและบุคลากรทางการศึกษา",
            "สกสค.",
        ),
        ("สำนักงานคณะกรรมการพัฒนาระบบราชการ", "ก.พ.ร."),
        ("สำนักงานคณะกรรมการคุ้มครองข้อมูลส่วนบุคคล", "สคส."),
    ]
    .iter()
    .map(|(name, label)| DepartmentAlias {
        name: (*name).to_string(),
        label: (*label).to_string(),
    })
    .collect()
}

#[derive(Deserialize, Clone, Debug)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default = "default_pg_password_env")]
    pub password_env: String,
    #[serde(default = "default_pg_max")]
    pub max_connections: u32,
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_password_env() -> String {
    "DPISLINE_PG_PASSWORD".to_string()
}

fn default_pg_max() -> u32 {
    5
}

impl PostgresConfig {
    /// Database password read from `password_env`. Kept out of any URL so
    /// it needs no escaping; the store builds its connect options field by
    /// field.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::Missing` if the password env var is unset or blank.
    pub fn password(&self) -> Result<String, SettingsError> {
        required_env(&self.password_env)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// `json` or `pretty`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            sample_rate: default_sample_rate(),
            log_format: default_log_format(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_log_format() -> String {
    "json".to_string()
}

// ---------------------------------------------------------------------------
// Credentials and validation
// ---------------------------------------------------------------------------

/// Errors from resolving secrets and validating settings.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("required environment variable {0} is not set")]
    Missing(String),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Secrets resolved from the environment once at startup.
#[derive(Clone)]
pub struct Credentials {
    pub channel_access_token: String,
    pub channel_secret: String,
    pub ai_base_url: String,
    pub ai_api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("channel_access_token", &"<redacted>")
            .field("channel_secret", &"<redacted>")
            .field("ai_base_url", &self.ai_base_url)
            .field("ai_api_key", &"<redacted>")
            .finish()
    }
}

fn required_env(name: &str) -> Result<String, SettingsError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(SettingsError::Missing(name.to_string())),
    }
}

impl Config {
    /// Load configuration from the file named by `DPISLINE_CONFIG`
    /// (default `config.toml`), with environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns `config::ConfigError` if the file is malformed or a value
    /// has the wrong type. A missing file is not an error.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(&config_path)
    }

    /// Same as [`Config::load`] with an explicit file path.
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn load_from(config_path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("ai.completion_paths")
                    .with_list_parse_key("registration.departments")
                    .try_parsing(true),
            )
            // Hosting platforms hand out the listening port as bare PORT.
            .set_override_option("service.port", std::env::var("PORT").ok())?
            .build()?;

        settings.try_deserialize()
    }

    /// Resolve the LINE and completion-gateway secrets from the environment.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::Missing` naming the first absent variable.
    pub fn credentials(&self) -> Result<Credentials, SettingsError> {
        let channel_access_token = required_env(&self.line.access_token_env)?;
        let channel_secret = required_env(&self.line.channel_secret_env)?;
        let ai_base_url = match required_env(&self.ai.base_url_env) {
            Ok(url) => url,
            Err(e) => match self.ai.base_url.as_deref().map(str::trim) {
                Some(url) if !url.is_empty() => url.to_string(),
                _ => return Err(e),
            },
        };
        let ai_api_key = required_env(&self.ai.api_key_env)?;
        Ok(Credentials {
            channel_access_token,
            channel_secret,
            ai_base_url: ai_base_url.trim_end_matches('/').to_string(),
            ai_api_key,
        })
    }

    /// Reject settings the gateway cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::Invalid` describing the first bad value.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.ai.completion_paths.is_empty() {
            return Err(SettingsError::Invalid(
                "ai.completion_paths must not be empty".to_string(),
            ));
        }
        if let Some(bad) = self
            .ai
            .completion_paths
            .iter()
            .find(|p| !p.starts_with('/'))
        {
            return Err(SettingsError::Invalid(format!(
                "ai.completion_paths entry {bad:?} must start with '/'"
            )));
        }
        if !(0.0..=2.0).contains(&self.ai.temperature) {
            return Err(SettingsError::Invalid(format!(
                "ai.temperature {} outside 0.0..=2.0",
                self.ai.temperature
            )));
        }
        if self.ai.timeout_seconds == 0 {
            return Err(SettingsError::Invalid(
                "ai.timeout_seconds must be positive".to_string(),
            ));
        }
        let reg = &self.registration;
        if reg.confirm_prefix.is_empty() {
            return Err(SettingsError::Invalid(
                "registration.confirm_prefix must not be empty".to_string(),
            ));
        }
        if reg.departments.is_empty() {
            return Err(SettingsError::Invalid(
                "registration.departments must not be empty".to_string(),
            ));
        }
        if reg.max_matches == 0 {
            return Err(SettingsError::Invalid(
                "registration.max_matches must be positive".to_string(),
            ));
        }
        if reg.max_options == 0 || reg.max_options > MAX_QUICK_REPLY_ITEMS {
            return Err(SettingsError::Invalid(format!(
                "registration.max_options must be within 1..={MAX_QUICK_REPLY_ITEMS}"
            )));
        }
        if !(0.0..=1.0).contains(&reg.similarity_cutoff) {
            return Err(SettingsError::Invalid(format!(
                "registration.similarity_cutoff {} outside 0.0..=1.0",
                reg.similarity_cutoff
            )));
        }
        Ok(())
    }
}
