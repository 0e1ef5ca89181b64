//! 推送服务搭建指南 - 根据订阅 JSON 生成服务端配置说明
//!
//! 使用 Anthropic Messages API 生成文本。失败只影响指南本身，
//! 不影响通知发送。
//!
//! API Key 读取优先级：
//! 1. 配置文件 `~/.config/push-lab/config.json` 的 `guidance.api_key` / `guidance.base_url`
//! 2. 环境变量 `ANTHROPIC_API_KEY` / `ANTHROPIC_BASE_URL`

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Anthropic API 基础 URL
pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// API 版本
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const DEFAULT_MODEL: &str = "claude-haiku-4-5-20251001";

/// 指南比较长，超时比普通提取宽松
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// 指南生成器
pub trait GuidanceGenerator: Send + Sync {
    fn generate(&self, subscription_json: &str) -> Result<String>;
}

/// 生成器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidanceConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
    pub max_tokens: u32,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: ANTHROPIC_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl GuidanceConfig {
    /// 环境变量覆盖配置文件中的空值
    pub fn apply_env(&mut self) {
        if self.api_key.is_empty() {
            if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
                if !key.is_empty() {
                    debug!("Using ANTHROPIC_API_KEY from environment");
                    self.api_key = key;
                }
            }
        }
        if let Ok(url) = std::env::var("ANTHROPIC_BASE_URL") {
            if !url.is_empty() {
                self.base_url = url;
            }
        }
        self.base_url = normalize_base_url(&self.base_url);
    }
}

/// 确保 URL 以 /v1/messages 结尾
fn normalize_base_url(url: &str) -> String {
    let u = url.trim_end_matches('/');
    if u.ends_with("/v1/messages") {
        u.to_string()
    } else if u.ends_with("/v1") {
        format!("{}/messages", u)
    } else {
        format!("{}/v1/messages", u)
    }
}

/// 生成指南的提示词
pub fn build_prompt(subscription_json: &str) -> String {
    format!(
        r#"I have a Web Push Subscription JSON:
{}

Please provide a comprehensive guide for a senior engineer to set up a Cloudflare Worker as a Push Server:
1. Instructions to generate VAPID keys (e.g., using 'npx web-push generate-vapid-keys').
2. A complete, copy-pasteable Cloudflare Worker script (using the 'web-push' library or native fetch if possible) that takes a POST request and sends a notification to this device.
3. How to store the VAPID Private Key as an environment variable in the Cloudflare dashboard.
4. A quick cURL command to test the Worker once deployed.

Format the response with clear headings and code blocks. Make it highly technical and concise."#,
        subscription_json
    )
}

/// 取出响应中所有 text 块并拼接
fn response_text(body: &serde_json::Value) -> String {
    body["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block["type"] == "text")
                .filter_map(|block| block["text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// 基于 Anthropic API 的指南生成器
pub struct AnthropicGuidance {
    client: reqwest::blocking::Client,
    config: GuidanceConfig,
}

impl AnthropicGuidance {
    pub fn new(config: GuidanceConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(anyhow!(
                "No Anthropic API key found. Set guidance.api_key in ~/.config/push-lab/config.json \
                 or the ANTHROPIC_API_KEY env var"
            ));
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| anyhow!("Cannot create HTTP client: {}", e))?;

        Ok(Self { client, config })
    }
}

impl GuidanceGenerator for AnthropicGuidance {
    fn generate(&self, subscription_json: &str) -> Result<String> {
        debug!(model = %self.config.model, "Requesting push setup guidance");

        let response = self
            .client
            .post(&self.config.base_url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": self.config.model,
                "max_tokens": self.config.max_tokens,
                "messages": [{"role": "user", "content": build_prompt(subscription_json)}],
            }))
            .send()
            .map_err(|e| anyhow!("Guidance request failed: {}", e))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .map_err(|e| anyhow!("Guidance response is not JSON ({}): {}", status, e))?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(anyhow!("API error ({}): {}", status, message));
        }

        let text = response_text(&body);
        if text.is_empty() {
            warn!("Empty guidance response");
            return Err(anyhow!("Empty response from guidance model"));
        }
        Ok(text)
    }
}
