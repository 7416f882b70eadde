//! Autopilot configuration loader: TOML file, then environment overrides,
//! then validation.

use cron::Schedule;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const KNOWN_PROVIDERS: &[&str] = &["openai", "gemini"];

#[derive(Debug, Clone, Deserialize)]
pub struct AutopilotConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub snapshots: SnapshotsConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_data_dir_setting")]
    pub data_dir: String,
    #[serde(default)]
    pub emergency_stop: bool,
    /// Generate decisions but never auto-apply them.
    #[serde(default)]
    pub safe_mode: bool,
}

fn default_data_dir_setting() -> String {
    "~/.autopilot/data".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_provider_order")]
    pub order: Vec<String>,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,
    #[serde(default)]
    pub openai_endpoint: Option<String>,
    #[serde(default)]
    pub gemini_endpoint: Option<String>,
    #[serde(default = "default_provider_timeout_seconds")]
    pub timeout_seconds: u64,
    /// When set, requests are wrapped as `{target, headers, body}` and sent
    /// here instead of to the provider.
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub proxy_token: Option<String>,
}

fn default_provider_order() -> Vec<String> {
    vec!["openai".to_string(), "gemini".to_string()]
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_gemini_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_provider_timeout_seconds() -> u64 {
    30
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            order: default_provider_order(),
            openai_model: default_openai_model(),
            gemini_model: default_gemini_model(),
            openai_endpoint: None,
            gemini_endpoint: None,
            timeout_seconds: default_provider_timeout_seconds(),
            proxy_url: None,
            proxy_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditsConfig {
    /// Granted once, the first time the global scope is seen.
    #[serde(default = "default_global_grant")]
    pub global_grant: i64,
    #[serde(default)]
    pub actor_grant: i64,
}

fn default_global_grant() -> i64 {
    100
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            global_grant: default_global_grant(),
            actor_grant: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit")]
    pub limit: u32,
    #[serde(default = "default_rate_window_seconds")]
    pub window_seconds: u64,
}

fn default_rate_limit() -> u32 {
    30
}

fn default_rate_window_seconds() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: default_rate_limit(),
            window_seconds: default_rate_window_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_max_fail_rate")]
    pub max_fail_rate: f64,
    #[serde(default = "default_min_sample")]
    pub min_sample: u64,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_confidence_baseline")]
    pub confidence_baseline: f64,
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_max_fail_rate() -> f64 {
    0.25
}

fn default_min_sample() -> u64 {
    10
}

fn default_window_days() -> u32 {
    7
}

fn default_confidence_baseline() -> f64 {
    0.5
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            max_fail_rate: default_max_fail_rate(),
            min_sample: default_min_sample(),
            window_days: default_window_days(),
            confidence_baseline: default_confidence_baseline(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Sqlite,
    /// Non-durable; everything is lost on exit.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_backend")]
    pub backend: QueueBackend,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: u64,
    #[serde(default = "default_backoff_max_seconds")]
    pub backoff_max_seconds: u64,
    #[serde(default = "default_lease_timeout_seconds")]
    pub lease_timeout_seconds: u64,
    #[serde(default = "default_task_timeout_seconds")]
    pub task_timeout_seconds: u64,
}

fn default_queue_backend() -> QueueBackend {
    QueueBackend::Sqlite
}

fn default_concurrency() -> usize {
    2
}

fn default_batch_size() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_seconds() -> u64 {
    30
}

fn default_backoff_max_seconds() -> u64 {
    3600
}

fn default_lease_timeout_seconds() -> u64 {
    600
}

fn default_task_timeout_seconds() -> u64 {
    120
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_seconds: default_backoff_base_seconds(),
            backoff_max_seconds: default_backoff_max_seconds(),
            lease_timeout_seconds: default_lease_timeout_seconds(),
            task_timeout_seconds: default_task_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotsConfig {
    #[serde(default = "default_keep_latest")]
    pub keep_latest: usize,
    /// Six-field cron expression (seconds first).
    #[serde(default = "default_cleanup_schedule")]
    pub cleanup_schedule: String,
}

fn default_keep_latest() -> usize {
    20
}

fn default_cleanup_schedule() -> String {
    "0 0 3 * * *".to_string()
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            keep_latest: default_keep_latest(),
            cleanup_schedule: default_cleanup_schedule(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviewConfig {
    /// Operators allowed to approve, reject and apply. Empty admits any
    /// named operator.
    #[serde(default)]
    pub operators: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_token: Option<String>,
    #[serde(default = "default_webhook_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_webhook_timeout_seconds() -> u64 {
    5
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_token: None,
            timeout_seconds: default_webhook_timeout_seconds(),
        }
    }
}

impl AutopilotConfig {
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: AutopilotConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AutopilotConfig =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse config: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = set("AUTOPILOT_EMERGENCY_STOP") {
            self.general.emergency_stop = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(v) = set("AUTOPILOT_DATA_DIR") {
            self.general.data_dir = v;
        }
        if let Some(v) = set("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = set("GEMINI_API_KEY") {
            self.keys.gemini_api_key = Some(v);
        }
        if let Some(v) = set("AUTOPILOT_WEBHOOK_URL") {
            self.notify.webhook_url = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.data_dir.trim().is_empty() {
            return Err(anyhow::anyhow!("general.data_dir is required"));
        }
        let r = &self.reliability;
        if !(0.0..=1.0).contains(&r.min_confidence) {
            return Err(anyhow::anyhow!(
                "reliability.min_confidence must be within [0, 1]"
            ));
        }
        if !(0.0..=1.0).contains(&r.max_fail_rate) {
            return Err(anyhow::anyhow!(
                "reliability.max_fail_rate must be within [0, 1]"
            ));
        }
        if r.min_sample == 0 {
            return Err(anyhow::anyhow!("reliability.min_sample must be >= 1"));
        }
        if !(r.confidence_baseline > 0.0 && r.confidence_baseline < 1.0) {
            return Err(anyhow::anyhow!(
                "reliability.confidence_baseline must be within (0, 1)"
            ));
        }
        if self.queue.concurrency == 0 {
            return Err(anyhow::anyhow!("queue.concurrency must be >= 1"));
        }
        if self.queue.batch_size == 0 {
            return Err(anyhow::anyhow!("queue.batch_size must be >= 1"));
        }
        if self.queue.max_attempts == 0 {
            return Err(anyhow::anyhow!("queue.max_attempts must be >= 1"));
        }
        if self.queue.task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("queue.task_timeout_seconds must be >= 1"));
        }
        // A lease shorter than the task timeout lets a still-running task be
        // reclaimed and executed twice.
        if self.queue.lease_timeout_seconds <= self.queue.task_timeout_seconds {
            return Err(anyhow::anyhow!(
                "queue.lease_timeout_seconds ({}) must exceed queue.task_timeout_seconds ({})",
                self.queue.lease_timeout_seconds,
                self.queue.task_timeout_seconds
            ));
        }
        if self.rate_limit.window_seconds == 0 {
            return Err(anyhow::anyhow!("rate_limit.window_seconds must be >= 1"));
        }
        if self.providers.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("providers.timeout_seconds must be >= 1"));
        }
        if let Some(unknown) = self
            .providers
            .order
            .iter()
            .find(|p| !KNOWN_PROVIDERS.contains(&p.as_str()))
        {
            return Err(anyhow::anyhow!(
                "unknown provider {unknown:?} in providers.order; expected one of: {}",
                KNOWN_PROVIDERS.join(", ")
            ));
        }
        Schedule::from_str(&self.snapshots.cleanup_schedule).map_err(|e| {
            anyhow::anyhow!(
                "invalid snapshots.cleanup_schedule {:?}: {e}",
                self.snapshots.cleanup_schedule
            )
        })?;
        Ok(())
    }

    pub fn data_dir_path(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    pub fn cleanup_schedule(&self) -> anyhow::Result<Schedule> {
        Schedule::from_str(&self.snapshots.cleanup_schedule)
            .map_err(|e| anyhow::anyhow!("invalid snapshots.cleanup_schedule: {e}"))
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None if raw == "~" => home_dir(),
        None => PathBuf::from(raw),
    }
}

pub fn default_config_path() -> PathBuf {
    Path::new(&home_dir()).join(".autopilot").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = AutopilotConfig::from_toml("[general]\n").expect("parse minimal");
        assert_eq!(cfg.providers.order, vec!["openai", "gemini"]);
        assert_eq!(cfg.queue.backend, QueueBackend::Sqlite);
        assert_eq!(cfg.queue.max_attempts, 5);
        assert_eq!(cfg.reliability.min_sample, 10);
        assert_eq!(cfg.snapshots.keep_latest, 20);
        assert!(!cfg.general.emergency_stop);
        assert!(cfg.cleanup_schedule().is_ok());
    }

    #[test]
    fn general_section_is_required() {
        assert!(AutopilotConfig::from_toml("[queue]\nconcurrency = 1\n").is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = [
            "[general]\n[reliability]\nmax_fail_rate = 1.5\n",
            "[general]\n[reliability]\nmin_sample = 0\n",
            "[general]\n[queue]\nconcurrency = 0\n",
            "[general]\n[providers]\norder = [\"openai\", \"claude\"]\n",
            "[general]\n[snapshots]\ncleanup_schedule = \"every night\"\n",
            "[general]\n[queue]\ntask_timeout_seconds = 0\n",
            "[general]\n[queue]\nlease_timeout_seconds = 60\ntask_timeout_seconds = 120\n",
            "[general]\n[queue]\nlease_timeout_seconds = 120\ntask_timeout_seconds = 120\n",
        ];
        for toml in bad {
            assert!(AutopilotConfig::from_toml(toml).is_err(), "accepted: {toml}");
        }
    }

    #[test]
    fn env_overrides_apply_before_validation() {
        let mut cfg = AutopilotConfig::from_toml(
            "[general]\ndata_dir = \"/srv/autopilot\"\n[queue]\nbackend = \"memory\"\n",
        )
        .expect("parse");
        cfg.apply_env_overrides(|key| match key {
            "AUTOPILOT_EMERGENCY_STOP" => Some("1".to_string()),
            "OPENAI_API_KEY" => Some("sk-test".to_string()),
            "GEMINI_API_KEY" => Some("   ".to_string()),
            _ => None,
        });
        assert!(cfg.general.emergency_stop);
        assert_eq!(cfg.keys.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.keys.gemini_api_key, None);
        assert_eq!(cfg.queue.backend, QueueBackend::Memory);
        assert_eq!(cfg.data_dir_path(), PathBuf::from("/srv/autopilot"));
    }

    #[tokio::test]
    async fn loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[general]\nsafe_mode = true\n[review]\noperators = [\"alice\"]\n")
            .await
            .expect("write config");
        let (cfg, loaded_from) = AutopilotConfig::load_with_path(Some(path.clone()))
            .await
            .expect("load");
        assert_eq!(loaded_from, path);
        assert!(cfg.general.safe_mode);
        assert_eq!(cfg.review.operators, vec!["alice"]);
    }
}
