//! 推送订阅管理 - 订阅、模拟、清除、序列化
//!
//! 沙箱环境下无法访问 Service Worker，这时使用固定的模拟订阅作为后备。
//! 真实订阅和模拟订阅是 `Subscription` 的两个变体，下游（序列化、剪贴板、
//! 指南生成）看到的文本完全相同，但模拟订阅永远不会被当作真实通道使用。

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::{HarnessError, HarnessResult, PlatformError, PlatformErrorKind};
use crate::key_codec::decode_application_key;
use crate::platform::{NotificationPlatform, SubscribeOptions};
use crate::single_flight::SingleFlight;
use crate::status::StatusMonitor;

/// 模拟订阅的固定端点
pub const SIMULATED_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send/mock-sandbox-subscription";
const SIMULATED_P256DH: &str =
    "BNcRdreALRFXTkOOUHK1EtK2wtaz5Ry4YfYCA_0QTpQtUbVlUls0VJXg7A8u-Ts1XbjhazAkj7I99e8QcYP7DkM";
const SIMULATED_AUTH: &str = "tBHItJI5svbpez7KI4CCXg";

/// 订阅密钥
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// 订阅数据（推送服务端点 + 密钥）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

/// 推送订阅
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// 平台签发的订阅
    Real(SubscriptionData),
    /// 沙箱环境下生成的模拟订阅
    Simulated(SubscriptionData),
}

impl Subscription {
    /// 固定的模拟订阅
    pub fn simulated() -> Self {
        Subscription::Simulated(SubscriptionData {
            endpoint: SIMULATED_ENDPOINT.to_string(),
            keys: SubscriptionKeys {
                p256dh: SIMULATED_P256DH.to_string(),
                auth: SIMULATED_AUTH.to_string(),
            },
        })
    }

    pub fn data(&self) -> &SubscriptionData {
        match self {
            Subscription::Real(data) | Subscription::Simulated(data) => data,
        }
    }

    /// 只有真实订阅才能拿到数据用于推送
    pub fn as_real(&self) -> Option<&SubscriptionData> {
        match self {
            Subscription::Real(data) => Some(data),
            Subscription::Simulated(_) => None,
        }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, Subscription::Simulated(_))
    }

    pub fn endpoint(&self) -> &str {
        &self.data().endpoint
    }

    pub fn label(&self) -> &'static str {
        match self {
            Subscription::Real(_) => "real",
            Subscription::Simulated(_) => "simulated",
        }
    }
}

/// 序列化为稳定的 JSON 文本（剪贴板导出和指南生成共用）
pub fn serialize(subscription: &Subscription) -> String {
    // 字段都是字符串，序列化不会失败
    serde_json::to_string_pretty(subscription.data()).unwrap_or_default()
}

/// 订阅管理器
pub struct SubscriptionManager {
    platform: Arc<dyn NotificationPlatform>,
    monitor: StatusMonitor,
    current: Mutex<Option<Subscription>>,
    flight: SingleFlight<HarnessResult<Subscription>>,
}

impl SubscriptionManager {
    pub fn new(platform: Arc<dyn NotificationPlatform>, monitor: StatusMonitor) -> Self {
        Self {
            platform,
            monitor,
            current: Mutex::new(None),
            flight: SingleFlight::new("subscribe"),
        }
    }

    /// 打开真实订阅
    ///
    /// 需要 Service Worker 已激活；沙箱中返回 `SandboxRestricted`。
    /// 并发调用会等待进行中的那一次订阅并拿到同一个结果。
    pub async fn subscribe(&self, application_key: &str) -> HarnessResult<Subscription> {
        let server_key = decode_application_key(application_key)?;

        let snapshot = self.monitor.latest();
        if snapshot.is_sandboxed {
            return Err(HarnessError::SandboxRestricted);
        }
        if !snapshot.service_worker_active {
            return Err(HarnessError::Subscription(
                "service worker is not active".to_string(),
            ));
        }

        let platform = Arc::clone(&self.platform);
        let result = self
            .flight
            .run(move || async move {
                let registration = platform
                    .service_worker()
                    .await
                    .map_err(subscription_error)?
                    .ok_or_else(|| {
                        HarnessError::Subscription(
                            "no active service worker registration".to_string(),
                        )
                    })?;

                let options = SubscribeOptions {
                    user_visible_only: true,
                    application_server_key: server_key,
                };
                let data = registration
                    .subscribe(&options)
                    .await
                    .map_err(subscription_error)?;
                Ok(Subscription::Real(data))
            })
            .await;

        match &result {
            Ok(subscription) => {
                info!(endpoint = %subscription.endpoint(), "Push subscription established");
                *self.lock() = Some(subscription.clone());
            }
            Err(e) => warn!(error = %e, "Push subscription failed"),
        }
        result
    }

    /// 沙箱中退回模拟订阅，否则打开真实订阅
    pub async fn subscribe_or_simulate(&self, application_key: &str) -> HarnessResult<Subscription> {
        if self.monitor.latest().is_sandboxed {
            info!("Sandboxed context detected, using simulated subscription");
            return Ok(self.simulate());
        }
        self.subscribe(application_key).await
    }

    /// 返回固定的模拟订阅，不调用平台
    pub fn simulate(&self) -> Subscription {
        let subscription = Subscription::simulated();
        *self.lock() = Some(subscription.clone());
        subscription
    }

    /// 只丢弃本地状态，不向平台退订
    pub fn clear(&self) {
        if self.lock().take().is_some() {
            info!("Subscription cleared");
        }
    }

    pub fn current(&self) -> Option<Subscription> {
        self.lock().clone()
    }

    pub fn serialize(&self, subscription: &Subscription) -> String {
        serialize(subscription)
    }

    pub fn is_subscribing(&self) -> bool {
        self.flight.in_flight()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn subscription_error(error: PlatformError) -> HarnessError {
    match error.kind {
        PlatformErrorKind::Security => HarnessError::SandboxRestricted,
        _ => HarnessError::Subscription(error.message),
    }
}
