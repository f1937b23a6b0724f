use std::time::Duration;

use paint_execution::PaintExecutionConfig;
use serde::{Deserialize, Serialize};
use tiles::{BackfillPolicy, DeviceTier, TransferQueueSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierSetting {
    Low,
    #[default]
    Standard,
    High,
}

impl From<TierSetting> for DeviceTier {
    fn from(setting: TierSetting) -> Self {
        match setting {
            TierSetting::Low => DeviceTier::Low,
            TierSetting::Standard => DeviceTier::Standard,
            TierSetting::High => DeviceTier::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillSetting {
    #[default]
    OnPartialUpdate,
    Never,
}

impl From<BackfillSetting> for BackfillPolicy {
    fn from(setting: BackfillSetting) -> Self {
        match setting {
            BackfillSetting::OnPartialUpdate => BackfillPolicy::OnPartialUpdate,
            BackfillSetting::Never => BackfillPolicy::Never,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid compositor config: {0}")]
    Parse(String),
    #[error("transfer queue needs at least one slot")]
    ZeroTransferSlots,
    #[error("at least one paint worker is required")]
    ZeroPaintWorkers,
    #[error("paint job queue needs at least one entry")]
    ZeroPaintJobQueue,
    #[error("upload failure threshold must be non-zero")]
    ZeroFailureThreshold,
}

/// Session settings. Every field has a default, so a JSON document only
/// names what it overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompositorConfig {
    pub tier: TierSetting,
    /// Overrides the tier's transfer queue size.
    pub transfer_queue_slots: Option<usize>,
    pub zoom_debounce_ms: u64,
    pub paint_workers: usize,
    pub paint_job_queue: usize,
    pub backfill: BackfillSetting,
    /// Consecutive frames whose uploads all failed before textures are
    /// abandoned for background fills.
    pub max_consecutive_upload_failures: u32,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        let paint = PaintExecutionConfig::default();
        Self {
            tier: TierSetting::default(),
            transfer_queue_slots: None,
            zoom_debounce_ms: 200,
            paint_workers: paint.worker_count,
            paint_job_queue: paint.job_queue_capacity,
            backfill: BackfillSetting::default(),
            max_consecutive_upload_failures: 3,
        }
    }
}

impl CompositorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|error| ConfigError::Parse(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_queue_slots == Some(0) {
            return Err(ConfigError::ZeroTransferSlots);
        }
        if self.paint_workers == 0 {
            return Err(ConfigError::ZeroPaintWorkers);
        }
        if self.paint_job_queue == 0 {
            return Err(ConfigError::ZeroPaintJobQueue);
        }
        if self.max_consecutive_upload_failures == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        Ok(())
    }

    pub fn device_tier(&self) -> DeviceTier {
        self.tier.into()
    }

    pub fn transfer_queue_size(&self) -> TransferQueueSize {
        match self.transfer_queue_slots {
            Some(slots) => TransferQueueSize::Custom(slots),
            None => self.device_tier().transfer_queue_size(),
        }
    }

    pub fn zoom_debounce(&self) -> Duration {
        Duration::from_millis(self.zoom_debounce_ms)
    }

    pub fn backfill_policy(&self) -> BackfillPolicy {
        self.backfill.into()
    }

    pub fn paint_execution(&self) -> PaintExecutionConfig {
        PaintExecutionConfig {
            worker_count: self.paint_workers,
            job_queue_capacity: self.paint_job_queue,
        }
    }
}
