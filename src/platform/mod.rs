//! 平台抽象层 - 权限、Service Worker、通知展示、推送订阅
//!
//! Harness 只通过这里的 trait 访问平台，平台状态可能随时被外部修改
//! （用户在浏览器设置里撤销权限、Service Worker 被注销），所以组件每次
//! 需要时都重新查询，而不是缓存。

pub mod display;
pub mod lab;

pub use display::DisplayCommand;
pub use lab::{DisplaySurface, LabEnvironment, LabPlatform, ShownNotification};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::PlatformError;
use crate::permission::PermissionState;
use crate::subscription::SubscriptionData;

/// 要展示的通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vibrate: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NotificationAction>,
}

impl NotificationRequest {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            icon: None,
            badge: None,
            tag: None,
            vibrate: Vec::new(),
            data: None,
            actions: Vec::new(),
        }
    }

    /// 页面发出的测试通知，每次使用唯一 tag，避免被平台合并
    pub fn test_notification(title: &str, body: &str) -> Self {
        let mut request = Self::new(title, body);
        request.icon = Some("https://picsum.photos/128/128".to_string());
        request.badge = Some("https://picsum.photos/48/48".to_string());
        request.tag = Some(format!("tester-{}", chrono::Utc::now().timestamp_millis()));
        request
    }
}

/// 通知上的操作按钮
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// 打开推送订阅的参数
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOptions {
    /// 每条推送都必须展示给用户
    pub user_visible_only: bool,
    pub application_server_key: Vec<u8>,
}

/// 通知平台（浏览器窗口一侧）
#[async_trait]
pub trait NotificationPlatform: Send + Sync {
    /// 当前权限值；API 不存在时返回 `Unsupported`
    fn permission(&self) -> Result<PermissionState, PlatformError>;

    /// 弹出权限提示，等待用户回答
    async fn request_permission(&self) -> Result<PermissionState, PlatformError>;

    fn is_secure_context(&self) -> bool;

    /// 是否被跨域嵌入（沙箱中无法访问 Service Worker）
    fn detect_sandbox(&self) -> Result<bool, PlatformError>;

    /// 查找已激活的 Service Worker registration，`Ok(None)` 表示没有注册
    async fn service_worker(
        &self,
    ) -> Result<Option<Arc<dyn ServiceWorkerRegistration>>, PlatformError>;

    /// 直接由页面展示通知
    async fn show_notification(&self, request: &NotificationRequest) -> Result<(), PlatformError>;
}

/// Service Worker registration 的能力
#[async_trait]
pub trait ServiceWorkerRegistration: Send + Sync {
    async fn show_notification(&self, request: &NotificationRequest) -> Result<(), PlatformError>;

    async fn subscribe(&self, options: &SubscribeOptions)
        -> Result<SubscriptionData, PlatformError>;

    /// 把一条推送消息投递给 Service Worker，返回它展示的通知
    async fn deliver_push(
        &self,
        subscription: &SubscriptionData,
        payload: Option<Vec<u8>>,
    ) -> Result<NotificationRequest, PlatformError>;
}
