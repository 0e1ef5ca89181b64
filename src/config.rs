//! 配置加载
//!
//! 读取顺序：`~/.config/push-lab/config.json` → 环境变量 → CLI 参数（由 main 覆盖）。
//! 文件不存在时使用默认值。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::guidance::GuidanceConfig;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::platform::LabEnvironment;
use crate::status::DEFAULT_POLL_INTERVAL;

pub const DEFAULT_TITLE: &str = "Deployment Test";
pub const DEFAULT_BODY: &str = "Testing notifications on Cloudflare!";

/// Harness 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub poll_interval_secs: u64,
    pub history_capacity: usize,
    pub default_title: String,
    pub default_body: String,
    /// base64url 编码的 VAPID 公钥
    pub application_server_key: Option<String>,
    /// 外部展示命令，例如 `notify-send`
    pub display_command: Option<String>,
    pub lab: LabEnvironment,
    pub guidance: GuidanceConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            default_title: DEFAULT_TITLE.to_string(),
            default_body: DEFAULT_BODY.to_string(),
            application_server_key: None,
            display_command: None,
            lab: LabEnvironment::default(),
            guidance: GuidanceConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// 默认配置文件路径
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/push-lab/config.json"))
    }

    /// 从指定文件加载，文件不存在时返回默认值
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// 加载默认路径并应用环境变量
    pub fn load_default() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
        self.guidance.apply_env();
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("PLAB_POLL_INTERVAL_SECS") {
            match value.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.poll_interval_secs = secs,
                _ => warn!(value = %value, "Ignoring invalid PLAB_POLL_INTERVAL_SECS"),
            }
        }
        if let Some(value) = lookup("PLAB_HISTORY_CAPACITY") {
            match value.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => self.history_capacity = capacity,
                _ => warn!(value = %value, "Ignoring invalid PLAB_HISTORY_CAPACITY"),
            }
        }
        if let Some(value) = lookup("PLAB_VAPID_KEY") {
            if !value.trim().is_empty() {
                self.application_server_key = Some(value.trim().to_string());
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
