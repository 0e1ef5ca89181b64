//! Harness - 持有所有组件的一次诊断会话
//!
//! 组件之间共享同一个平台、同一个状态监控器、同一份历史和同一个错误槽。
//! `shutdown()` 或 drop 时停止轮询并取消等待中的延迟发送。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::dispatcher::{DeliveryOutcome, NotificationDispatcher};
use crate::error::{HarnessError, HarnessResult, LastError};
use crate::guidance::GuidanceGenerator;
use crate::history::{HistoryItem, HistoryLog, SharedHistory};
use crate::permission::{PermissionController, PermissionState};
use crate::platform::NotificationPlatform;
use crate::status::{ReadinessSnapshot, StatusMonitor};
use crate::subscription::{self, Subscription, SubscriptionManager};

pub struct Harness {
    monitor: StatusMonitor,
    permission: PermissionController,
    subscriptions: SubscriptionManager,
    dispatcher: NotificationDispatcher,
    history: SharedHistory,
    last_error: Arc<LastError>,
    default_title: String,
    default_body: String,
    shut_down: AtomicBool,
}

impl Harness {
    /// 创建所有组件并启动状态轮询
    pub async fn start(platform: Arc<dyn NotificationPlatform>, config: &HarnessConfig) -> Self {
        let monitor = StatusMonitor::new(Arc::clone(&platform));
        let history = HistoryLog::shared(config.history_capacity);
        let last_error = Arc::new(LastError::new());

        let harness = Self {
            permission: PermissionController::new(Arc::clone(&platform), monitor.clone()),
            subscriptions: SubscriptionManager::new(Arc::clone(&platform), monitor.clone()),
            dispatcher: NotificationDispatcher::new(
                platform,
                monitor.clone(),
                Arc::clone(&history),
                Arc::clone(&last_error),
            ),
            monitor,
            history,
            last_error,
            default_title: config.default_title.clone(),
            default_body: config.default_body.clone(),
            shut_down: AtomicBool::new(false),
        };

        let snapshot = harness.monitor.start(config.poll_interval()).await;
        if !snapshot.notifications_supported {
            harness.last_error.set(&HarnessError::PermissionRequest(
                "this environment does not support desktop notifications".to_string(),
            ));
        }
        info!(
            permission = %snapshot.permission,
            service_worker = snapshot.service_worker_active,
            sandboxed = snapshot.is_sandboxed,
            "Harness started"
        );
        harness
    }

    pub fn readiness(&self) -> ReadinessSnapshot {
        self.monitor.latest()
    }

    pub async fn refresh(&self) -> ReadinessSnapshot {
        self.monitor.refresh().await
    }

    /// 请求权限；用户拒绝时返回 `Ok(Denied)` 并在错误槽里记录
    pub async fn request_permission(&self) -> HarnessResult<PermissionState> {
        let result = self.last_error.track(self.permission.request_permission().await);
        match &result {
            Ok(PermissionState::Denied) => self.last_error.set(&HarnessError::PermissionDenied),
            Ok(PermissionState::Granted) => self.last_error.clear(),
            _ => {}
        }
        result
    }

    pub fn permission(&self) -> PermissionState {
        self.permission.current()
    }

    pub async fn dispatch(
        &self,
        title: &str,
        body: &str,
        delay: Duration,
    ) -> HarnessResult<DeliveryOutcome> {
        self.dispatcher.dispatch(title, body, delay).await
    }

    /// 使用配置里的默认标题和正文发送
    pub async fn send_default(&self, delay: Duration) -> HarnessResult<DeliveryOutcome> {
        self.dispatcher
            .dispatch(&self.default_title, &self.default_body, delay)
            .await
    }

    pub fn is_pending(&self) -> bool {
        self.dispatcher.is_pending()
    }

    pub fn cancel_pending(&self) -> bool {
        self.dispatcher.cancel_pending()
    }

    pub async fn subscribe(&self, application_key: &str) -> HarnessResult<Subscription> {
        self.last_error
            .track(self.subscriptions.subscribe(application_key).await)
    }

    pub async fn subscribe_or_simulate(&self, application_key: &str) -> HarnessResult<Subscription> {
        self.last_error
            .track(self.subscriptions.subscribe_or_simulate(application_key).await)
    }

    pub fn simulate(&self) -> Subscription {
        self.subscriptions.simulate()
    }

    pub fn clear_subscription(&self) {
        self.subscriptions.clear();
    }

    pub fn current_subscription(&self) -> Option<Subscription> {
        self.subscriptions.current()
    }

    /// 导出当前订阅的 JSON 文本
    pub fn export_subscription(&self) -> Option<String> {
        self.subscriptions.current().map(|s| subscription::serialize(&s))
    }

    pub fn is_subscribing(&self) -> bool {
        self.subscriptions.is_subscribing()
    }

    /// 向当前订阅投递推送消息
    pub async fn deliver_push(&self, payload: Option<Vec<u8>>) -> HarnessResult<HistoryItem> {
        let Some(current) = self.subscriptions.current() else {
            let err = HarnessError::Subscription("no push subscription to deliver to".to_string());
            self.last_error.set(&err);
            return Err(err);
        };
        self.dispatcher.deliver_push(&current, payload).await
    }

    /// 为当前订阅生成推送服务搭建指南
    ///
    /// 生成器是阻塞调用，放到 blocking 线程池执行。
    pub async fn generate_guidance(
        &self,
        generator: Arc<dyn GuidanceGenerator>,
    ) -> HarnessResult<String> {
        let result = self.generate_guidance_inner(generator).await;
        self.last_error.track(result)
    }

    async fn generate_guidance_inner(
        &self,
        generator: Arc<dyn GuidanceGenerator>,
    ) -> HarnessResult<String> {
        let json = self.export_subscription().ok_or_else(|| {
            HarnessError::Guidance("no push subscription to describe".to_string())
        })?;

        let joined = tokio::task::spawn_blocking(move || generator.generate(&json))
            .await
            .map_err(|e| HarnessError::Guidance(e.to_string()))?;

        joined.map_err(|e| {
            warn!(error = %e, "Guidance generation failed");
            HarnessError::Guidance(e.to_string())
        })
    }

    pub fn history(&self) -> Vec<HistoryItem> {
        self.history
            .lock()
            .map(|log| log.items())
            .unwrap_or_else(|e| e.into_inner().items())
    }

    pub fn clear_history(&self) {
        match self.history.lock() {
            Ok(mut log) => log.clear(),
            Err(e) => e.into_inner().clear(),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }

    /// 停止轮询并取消延迟发送，可重复调用
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.monitor.stop();
        self.dispatcher.cancel_pending();
        info!("Harness shut down");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown();
    }
}
