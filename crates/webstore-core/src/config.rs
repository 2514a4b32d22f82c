//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use webstore_index::IndexConfig;
use webstore_policy::{
    Attribute, AttributeValue, ExceededHandling, Quota, QuotaPolicy, StorageClass,
};

use crate::Result;

const MIB: u64 = 1024 * 1024;

/// What to do when policy says "ask" but the statement names no window to
/// show the prompt in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFallback {
    /// Fail the statement with quota-exceeded.
    #[default]
    Deny,
    /// Prompt anyway, without a target window.
    Prompt,
}

/// Engine-level policy defaults for one storage class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDefaults {
    pub class: StorageClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_quota: Option<Quota>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_quota: Option<Quota>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exceeded_handling: Option<ExceededHandling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_objects_per_origin: Option<u32>,
    /// Milliseconds, 0 for none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_timeout_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_result_set_size: Option<Quota>,
}

impl ClassDefaults {
    pub fn new(class: StorageClass) -> Self {
        Self {
            class,
            global_quota: None,
            origin_quota: None,
            exceeded_handling: None,
            max_objects_per_origin: None,
            query_timeout_ms: None,
            max_result_set_size: None,
        }
    }

    fn values(&self) -> Vec<(Attribute, AttributeValue)> {
        let mut values = Vec::new();
        if let Some(quota) = self.global_quota {
            values.push((Attribute::GlobalQuota, AttributeValue::Quota(quota)));
        }
        if let Some(quota) = self.origin_quota {
            values.push((Attribute::OriginQuota, AttributeValue::Quota(quota)));
        }
        if let Some(handling) = self.exceeded_handling {
            values.push((Attribute::ExceededHandling, AttributeValue::Handling(handling)));
        }
        if let Some(max) = self.max_objects_per_origin {
            values.push((Attribute::MaxObjectsPerOrigin, AttributeValue::Count(max)));
        }
        if let Some(ms) = self.query_timeout_ms {
            values.push((Attribute::QueryTimeout, AttributeValue::Millis(ms)));
        }
        if let Some(quota) = self.max_result_set_size {
            values.push((Attribute::MaxResultSetSize, AttributeValue::Quota(quota)));
        }
        values
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root folder of the default context
    pub profile_dir: PathBuf,
    /// Folder under the root holding data files
    pub storage_subfolder: String,
    /// Index file name under the root
    pub index_file: String,
    /// Per-class policy defaults
    pub class_defaults: Vec<ClassDefaults>,
    /// Engine operations between progress callbacks
    pub progress_period: u32,
    /// Rows fetched per step while caching a result set
    pub stepping_batch: usize,
    /// First busy backoff delay, doubled on every retry
    pub yield_backoff_ms: u64,
    /// Longest delay the object ever schedules itself with
    pub max_schedule_delay_ms: u64,
    /// Busy retries before a statement gives up with a timeout
    pub busy_retry_limit: u32,
    /// Delay before resuming after a quota prompt reply
    pub quota_reply_delay_ms: u64,
    /// Delete-and-recreate attempts for a corrupted data file
    pub corruption_recovery_attempts: u32,
    pub bad_tries_limit: u32,
    pub good_tries_limit: u32,
    /// Origins dropped when loading an index file
    pub skipped_origins: Vec<String>,
    pub ask_without_prompt_target: PromptFallback,
}

impl Config {
    pub fn new(profile_dir: impl Into<PathBuf>) -> Self {
        let index = IndexConfig::default();
        Self {
            profile_dir: profile_dir.into(),
            storage_subfolder: index.subfolder,
            index_file: index.index_file,
            class_defaults: Self::default_class_defaults(),
            progress_period: 200,
            stepping_batch: 50,
            yield_backoff_ms: 10,
            max_schedule_delay_ms: 2000,
            busy_retry_limit: 8,
            quota_reply_delay_ms: 5,
            corruption_recovery_attempts: 3,
            bad_tries_limit: index.bad_tries_limit,
            good_tries_limit: index.good_tries_limit,
            skipped_origins: index.skipped_origins,
            ask_without_prompt_target: PromptFallback::Deny,
        }
    }

    pub fn default_class_defaults() -> Vec<ClassDefaults> {
        vec![
            ClassDefaults {
                origin_quota: Some(Quota::Bytes(5 * MIB)),
                exceeded_handling: Some(ExceededHandling::Ask),
                max_result_set_size: Some(Quota::Bytes(20 * MIB)),
                ..ClassDefaults::new(StorageClass::WebDatabase)
            },
            ClassDefaults {
                origin_quota: Some(Quota::Bytes(5 * MIB)),
                exceeded_handling: Some(ExceededHandling::Deny),
                ..ClassDefaults::new(StorageClass::LocalStorage)
            },
            ClassDefaults {
                origin_quota: Some(Quota::Bytes(5 * MIB)),
                exceeded_handling: Some(ExceededHandling::Deny),
                ..ClassDefaults::new(StorageClass::UserScript)
            },
            ClassDefaults::new(StorageClass::WidgetPreferences),
        ]
    }

    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            crate::StorageError::NoAccess(format!("{}: {e}", path.display()))
        })?;
        let config = serde_json::from_str(&text)
            .map_err(|e| crate::StorageError::Internal(format!("invalid config: {e}")))?;
        Ok(config)
    }

    pub fn with_class_defaults(mut self, defaults: ClassDefaults) -> Self {
        self.class_defaults.retain(|d| d.class != defaults.class);
        self.class_defaults.push(defaults);
        self
    }

    pub fn with_progress_period(mut self, period: u32) -> Self {
        self.progress_period = period.max(1);
        self
    }

    pub fn with_stepping_batch(mut self, rows: usize) -> Self {
        self.stepping_batch = rows.max(1);
        self
    }

    pub fn with_busy_retry_limit(mut self, limit: u32) -> Self {
        self.busy_retry_limit = limit;
        self
    }

    pub fn with_corruption_recovery_attempts(mut self, attempts: u32) -> Self {
        self.corruption_recovery_attempts = attempts;
        self
    }

    pub fn with_prompt_fallback(mut self, fallback: PromptFallback) -> Self {
        self.ask_without_prompt_target = fallback;
        self
    }

    pub fn with_skipped_origins(mut self, origins: Vec<String>) -> Self {
        self.skipped_origins = origins;
        self
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            subfolder: self.storage_subfolder.clone(),
            index_file: self.index_file.clone(),
            bad_tries_limit: self.bad_tries_limit,
            good_tries_limit: self.good_tries_limit,
            skipped_origins: self.skipped_origins.clone(),
        }
    }

    /// Installs the class defaults into `policy`.
    pub fn apply_policy(&self, policy: &QuotaPolicy) -> Result<()> {
        for defaults in &self.class_defaults {
            for (attribute, value) in defaults.values() {
                if policy.is_configurable(attribute, defaults.class) {
                    policy.set_class_default(defaults.class, attribute, value)?;
                } else {
                    tracing::warn!(
                        class = %defaults.class,
                        attribute = %attribute,
                        "Ignoring default for a fixed attribute"
                    );
                }
            }
        }
        Ok(())
    }

    pub(crate) fn yield_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(31)).unwrap_or(u64::MAX);
        let ms = self.yield_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_schedule_delay_ms))
    }

    pub(crate) fn max_schedule_delay(&self) -> Duration {
        Duration::from_millis(self.max_schedule_delay_ms)
    }

    pub(crate) fn quota_reply_delay(&self) -> Duration {
        Duration::from_millis(self.quota_reply_delay_ms)
    }

    fn default_profile_dir() -> PathBuf {
        std::env::var("XDG_DATA_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".local/share"))
            })
            .map(|d| d.join("webstore"))
            .unwrap_or_else(|| PathBuf::from(".webstore"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::default_profile_dir())
    }
}
