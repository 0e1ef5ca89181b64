//! Push Lab - Web 推送通知诊断工具
//!
//! 检查通知权限、Service Worker、安全上下文和沙箱状态，
//! 发送测试通知，管理推送订阅。

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod guidance;
pub mod harness;
pub mod history;
pub mod key_codec;
pub mod permission;
pub mod platform;
pub mod service_worker;
pub mod single_flight;
pub mod status;
pub mod subscription;

pub use config::HarnessConfig;
pub use dispatcher::{DeliveryOutcome, DeliveryPath, NotificationDispatcher, ScheduledDispatch};
pub use error::{ErrorKind, HarnessError, HarnessResult, LastError, PlatformError, PlatformErrorKind};
pub use guidance::{AnthropicGuidance, GuidanceConfig, GuidanceGenerator};
pub use harness::Harness;
pub use history::{DeliveryMethod, HistoryItem, HistoryLog};
pub use key_codec::decode_application_key;
pub use permission::{PermissionController, PermissionState};
pub use platform::{
    DisplayCommand, LabEnvironment, LabPlatform, NotificationPlatform, NotificationRequest,
    ServiceWorkerRegistration,
};
pub use service_worker::{ClickOutcome, ServiceWorkerController};
pub use status::{ReadinessSnapshot, StatusMonitor};
pub use subscription::{Subscription, SubscriptionData, SubscriptionManager};
