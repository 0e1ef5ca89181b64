//! 通知分发器 - 选择投递路径并发送测试通知
//!
//! 每次发送都重新向平台确认权限，不依赖缓存的界面状态。
//! 路径在发送时根据最新快照二选一：Service Worker 或页面直接展示。
//! Service Worker 路径失败时直接报告失败，不会退回直接展示。

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult, LastError, PlatformError, PlatformErrorKind};
use crate::history::{DeliveryMethod, HistoryItem, SharedHistory};
use crate::permission::PermissionState;
use crate::platform::{NotificationPlatform, NotificationRequest};
use crate::status::{ReadinessSnapshot, StatusMonitor};
use crate::subscription::Subscription;

/// 投递路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    ServiceWorker,
    Direct,
}

impl DeliveryPath {
    pub fn select(snapshot: &ReadinessSnapshot) -> Self {
        if snapshot.service_worker_active {
            DeliveryPath::ServiceWorker
        } else {
            DeliveryPath::Direct
        }
    }

    pub fn method(&self) -> DeliveryMethod {
        match self {
            DeliveryPath::ServiceWorker => DeliveryMethod::ServiceWorker,
            DeliveryPath::Direct => DeliveryMethod::Local,
        }
    }
}

/// 发送结果
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// 已展示并记入历史
    Delivered(HistoryItem),
    /// 已排期，延迟到期后发送
    Scheduled(ScheduledDispatch),
}

impl DeliveryOutcome {
    pub fn delivered(&self) -> Option<&HistoryItem> {
        match self {
            DeliveryOutcome::Delivered(item) => Some(item),
            DeliveryOutcome::Scheduled(_) => None,
        }
    }
}

/// 已排期的延迟发送
#[derive(Debug)]
pub struct ScheduledDispatch {
    pub fires_at: DateTime<Utc>,
    result: oneshot::Receiver<HarnessResult<HistoryItem>>,
}

impl ScheduledDispatch {
    /// 等待延迟发送完成；被取消时返回 `Dispatch` 错误
    pub async fn wait(self) -> HarnessResult<HistoryItem> {
        self.result.await.unwrap_or_else(|_| {
            Err(HarnessError::Dispatch(
                "scheduled notification was cancelled".to_string(),
            ))
        })
    }
}

struct PendingDispatch {
    id: u64,
    handle: JoinHandle<()>,
}

struct DispatcherInner {
    platform: Arc<dyn NotificationPlatform>,
    monitor: StatusMonitor,
    history: SharedHistory,
    last_error: Arc<LastError>,
    pending: Mutex<Option<PendingDispatch>>,
    next_id: AtomicU64,
}

impl DispatcherInner {
    /// 发送前从平台重新读取权限
    fn ensure_permission(&self) -> HarnessResult<()> {
        match self.platform.permission() {
            Ok(PermissionState::Granted) => Ok(()),
            Ok(state) => {
                debug!(permission = %state, "Dispatch refused, permission not granted");
                Err(HarnessError::PermissionRequired)
            }
            Err(e) => {
                debug!(error = %e, "Dispatch refused, permission API unavailable");
                Err(HarnessError::PermissionRequired)
            }
        }
    }

    async fn deliver(&self, title: &str, body: &str) -> HarnessResult<HistoryItem> {
        self.ensure_permission()?;

        let path = DeliveryPath::select(&self.monitor.latest());
        let request = NotificationRequest::test_notification(title, body);

        match path {
            DeliveryPath::ServiceWorker => {
                let registration = self
                    .platform
                    .service_worker()
                    .await
                    .map_err(dispatch_error)?
                    .ok_or_else(|| {
                        HarnessError::Dispatch(
                            "service worker registration is no longer available".to_string(),
                        )
                    })?;
                registration
                    .show_notification(&request)
                    .await
                    .map_err(dispatch_error)?;
            }
            DeliveryPath::Direct => {
                self.platform
                    .show_notification(&request)
                    .await
                    .map_err(dispatch_error)?;
            }
        }

        Ok(self.record(HistoryItem::new(title, body, path.method())))
    }

    fn record(&self, item: HistoryItem) -> HistoryItem {
        info!(
            id = %item.id,
            method = %item.method,
            title = %item.title,
            "Notification delivered"
        );
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .append(item.clone());
        self.last_error.clear();
        item
    }

    fn clear_pending(&self, id: u64) {
        let mut pending = self.lock_pending();
        if pending.as_ref().map(|p| p.id) == Some(id) {
            *pending = None;
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingDispatch>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn dispatch_error(error: PlatformError) -> HarnessError {
    match error.kind {
        PlatformErrorKind::Security => HarnessError::Dispatch(format!(
            "{}. Ensure you are visiting via HTTPS",
            error.message
        )),
        PlatformErrorKind::Unsupported => HarnessError::Dispatch(format!(
            "{} (notifications are not supported here)",
            error.message
        )),
        _ => HarnessError::Dispatch(error.message),
    }
}

/// 通知分发器
///
/// 同一时间最多一个延迟发送；延迟期间拒绝新的延迟发送，但立即发送不受影响。
/// 分发器被丢弃时取消未到期的延迟发送。
pub struct NotificationDispatcher {
    inner: Arc<DispatcherInner>,
}

impl NotificationDispatcher {
    pub fn new(
        platform: Arc<dyn NotificationPlatform>,
        monitor: StatusMonitor,
        history: SharedHistory,
        last_error: Arc<LastError>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                platform,
                monitor,
                history,
                last_error,
                pending: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// 发送测试通知，`delay` 为零时立即发送
    pub async fn dispatch(
        &self,
        title: &str,
        body: &str,
        delay: Duration,
    ) -> HarnessResult<DeliveryOutcome> {
        let result = self.dispatch_inner(title, body, delay).await;
        self.inner.last_error.track(result)
    }

    async fn dispatch_inner(
        &self,
        title: &str,
        body: &str,
        delay: Duration,
    ) -> HarnessResult<DeliveryOutcome> {
        self.inner.ensure_permission()?;

        if delay.is_zero() {
            return self
                .inner
                .deliver(title, body)
                .await
                .map(DeliveryOutcome::Delivered);
        }

        self.schedule(title.to_string(), body.to_string(), delay)
            .map(DeliveryOutcome::Scheduled)
    }

    fn schedule(&self, title: String, body: String, delay: Duration) -> HarnessResult<ScheduledDispatch> {
        let mut pending = self.inner.lock_pending();
        if pending.is_some() {
            warn!("Delayed dispatch rejected, another one is pending");
            return Err(HarnessError::DispatchPending);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let fires_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = inner.last_error.track(inner.deliver(&title, &body).await);
            inner.clear_pending(id);
            let _ = tx.send(result);
        });

        *pending = Some(PendingDispatch { id, handle });
        info!(delay_secs = delay.as_secs_f64(), %fires_at, "Notification scheduled");
        Ok(ScheduledDispatch { fires_at, result: rx })
    }

    /// 是否有延迟发送在等待
    pub fn is_pending(&self) -> bool {
        self.inner.lock_pending().is_some()
    }

    /// 取消等待中的延迟发送，返回是否真的取消了
    pub fn cancel_pending(&self) -> bool {
        match self.inner.lock_pending().take() {
            Some(pending) => {
                pending.handle.abort();
                info!("Pending notification cancelled");
                true
            }
            None => false,
        }
    }

    /// 向真实订阅投递一条推送消息（经 Service Worker 展示）
    ///
    /// 模拟订阅没有真实通道，直接拒绝。
    pub async fn deliver_push(
        &self,
        subscription: &Subscription,
        payload: Option<Vec<u8>>,
    ) -> HarnessResult<HistoryItem> {
        let result = self.deliver_push_inner(subscription, payload).await;
        self.inner.last_error.track(result)
    }

    async fn deliver_push_inner(
        &self,
        subscription: &Subscription,
        payload: Option<Vec<u8>>,
    ) -> HarnessResult<HistoryItem> {
        let data = subscription.as_real().ok_or_else(|| {
            warn!("Refusing to push to a simulated subscription");
            HarnessError::SandboxRestricted
        })?;
        self.inner.ensure_permission()?;

        let registration = self
            .inner
            .platform
            .service_worker()
            .await
            .map_err(dispatch_error)?
            .ok_or_else(|| HarnessError::Dispatch("no active service worker".to_string()))?;
        let shown = registration
            .deliver_push(data, payload)
            .await
            .map_err(dispatch_error)?;

        Ok(self
            .inner
            .record(HistoryItem::new(shown.title, shown.body, DeliveryMethod::Remote)))
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryLog;
    use crate::platform::{DisplaySurface, LabEnvironment, LabPlatform};

    struct Rig {
        platform: Arc<LabPlatform>,
        dispatcher: NotificationDispatcher,
        history: SharedHistory,
        last_error: Arc<LastError>,
    }

    async fn rig(env: LabEnvironment) -> Rig {
        let platform = Arc::new(LabPlatform::new(env));
        let monitor = StatusMonitor::new(platform.clone());
        monitor.refresh().await;
        let history = HistoryLog::shared(10);
        let last_error = Arc::new(LastError::new());
        let dispatcher =
            NotificationDispatcher::new(platform.clone(), monitor, history.clone(), last_error.clone());
        Rig {
            platform,
            dispatcher,
            history,
            last_error,
        }
    }

    fn granted() -> LabEnvironment {
        LabEnvironment {
            initial_permission: PermissionState::Granted,
            ..LabEnvironment::default()
        }
    }

    fn history_len(rig: &Rig) -> usize {
        rig.history.lock().unwrap().len()
    }

    #[test]
    fn test_path_selection() {
        let mut snapshot = ReadinessSnapshot::unknown();
        assert_eq!(DeliveryPath::select(&snapshot), DeliveryPath::Direct);
        snapshot.service_worker_active = true;
        assert_eq!(DeliveryPath::select(&snapshot), DeliveryPath::ServiceWorker);
        assert_eq!(DeliveryPath::ServiceWorker.method(), DeliveryMethod::ServiceWorker);
        assert_eq!(DeliveryPath::Direct.method(), DeliveryMethod::Local);
    }

    #[tokio::test]
    async fn test_dispatch_without_permission() {
        let rig = rig(LabEnvironment::default()).await;

        let err = rig.dispatcher.dispatch("t", "b", Duration::ZERO).await.unwrap_err();

        assert_eq!(err, HarnessError::PermissionRequired);
        assert_eq!(history_len(&rig), 0);
        assert!(rig.platform.shown().is_empty());
        assert!(rig.last_error.get().is_some());
    }

    #[tokio::test]
    async fn test_dispatch_via_service_worker() {
        let rig = rig(granted()).await;

        let outcome = rig.dispatcher.dispatch("Title", "Body", Duration::ZERO).await.unwrap();
        let item = outcome.delivered().unwrap();

        assert_eq!(item.method, DeliveryMethod::ServiceWorker);
        assert_eq!((item.title.as_str(), item.body.as_str()), ("Title", "Body"));
        assert_eq!(rig.platform.shown()[0].surface, DisplaySurface::ServiceWorker);
    }

    #[tokio::test]
    async fn test_dispatch_direct_without_service_worker() {
        let rig = rig(LabEnvironment {
            service_worker: false,
            ..granted()
        })
        .await;

        let outcome = rig.dispatcher.dispatch("Title", "Body", Duration::ZERO).await.unwrap();

        assert_eq!(outcome.delivered().unwrap().method, DeliveryMethod::Local);
        assert_eq!(rig.platform.shown()[0].surface, DisplaySurface::Page);
    }

    #[tokio::test]
    async fn test_permission_revoked_between_polls() {
        let rig = rig(granted()).await;
        // 快照仍然显示 granted
        rig.platform.set_permission(PermissionState::Denied);

        let err = rig.dispatcher.dispatch("t", "b", Duration::ZERO).await.unwrap_err();
        assert_eq!(err, HarnessError::PermissionRequired);
        assert_eq!(history_len(&rig), 0);
    }

    #[tokio::test]
    async fn test_service_worker_failure_does_not_fall_back() {
        let rig = rig(granted()).await;
        rig.platform
            .fail_next_display(PlatformError::security("The operation is insecure"));

        let err = rig.dispatcher.dispatch("t", "b", Duration::ZERO).await.unwrap_err();

        match err {
            HarnessError::Dispatch(message) => assert!(message.contains("HTTPS")),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(rig.platform.shown().is_empty());
        assert_eq!(history_len(&rig), 0);
    }

    #[tokio::test]
    async fn test_success_clears_prior_error() {
        let rig = rig(granted()).await;
        rig.platform.fail_next_display(PlatformError::other("boom"));
        assert!(rig.dispatcher.dispatch("t", "b", Duration::ZERO).await.is_err());
        assert_eq!(rig.last_error.get().unwrap(), "notification failed: boom");

        rig.dispatcher.dispatch("t", "b", Duration::ZERO).await.unwrap();
        assert!(rig.last_error.get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_dispatch_sets_pending() {
        let rig = rig(granted()).await;

        let outcome = rig
            .dispatcher
            .dispatch("Alert", "Body", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(rig.dispatcher.is_pending());
        assert_eq!(history_len(&rig), 0);

        let scheduled = match outcome {
            DeliveryOutcome::Scheduled(s) => s,
            DeliveryOutcome::Delivered(_) => panic!("should be scheduled"),
        };
        let item = scheduled.wait().await.unwrap();

        assert_eq!(item.method, DeliveryMethod::ServiceWorker);
        assert!(!rig.dispatcher.is_pending());
        assert_eq!(history_len(&rig), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_delayed_dispatch_rejected_but_immediate_allowed() {
        let rig = rig(granted()).await;

        rig.dispatcher
            .dispatch("first", "b", Duration::from_secs(5))
            .await
            .unwrap();
        let err = rig
            .dispatcher
            .dispatch("second", "b", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, HarnessError::DispatchPending);
        assert!(rig.dispatcher.is_pending());

        let now = rig.dispatcher.dispatch("now", "b", Duration::ZERO).await.unwrap();
        assert_eq!(now.delivered().unwrap().title, "now");
        assert!(rig.dispatcher.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_dispatch_never_fires() {
        let rig = rig(granted()).await;

        let outcome = rig
            .dispatcher
            .dispatch("later", "b", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(rig.dispatcher.cancel_pending());
        assert!(!rig.dispatcher.cancel_pending());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(history_len(&rig), 0);
        assert!(rig.platform.shown().is_empty());

        if let DeliveryOutcome::Scheduled(scheduled) = outcome {
            assert!(scheduled.wait().await.is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_dispatch_rechecks_permission_when_firing() {
        let rig = rig(granted()).await;

        let outcome = rig
            .dispatcher
            .dispatch("later", "b", Duration::from_secs(5))
            .await
            .unwrap();
        rig.platform.set_permission(PermissionState::Denied);

        let DeliveryOutcome::Scheduled(scheduled) = outcome else {
            panic!("should be scheduled");
        };
        assert_eq!(scheduled.wait().await.unwrap_err(), HarnessError::PermissionRequired);
        assert_eq!(history_len(&rig), 0);
        assert!(!rig.dispatcher.is_pending());
    }

    #[tokio::test]
    async fn test_push_to_simulated_subscription_is_refused() {
        let rig = rig(granted()).await;

        let err = rig
            .dispatcher
            .deliver_push(&Subscription::simulated(), None)
            .await
            .unwrap_err();

        assert_eq!(err, HarnessError::SandboxRestricted);
        assert!(rig.platform.controller().displayed().is_empty());
        assert_eq!(history_len(&rig), 0);
    }
}
