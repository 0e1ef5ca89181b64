//! 就绪状态监控 - 定时轮询平台状态
//!
//! 每次轮询生成完整的 `ReadinessSnapshot` 并整体替换旧值。平台查询失败时
//! 对应字段降级为安全默认值（Service Worker 不可用、视为沙箱），不向外抛错。

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::PlatformErrorKind;
use crate::permission::PermissionState;
use crate::platform::NotificationPlatform;

/// 默认轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// 一次轮询得到的就绪状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessSnapshot {
    pub permission: PermissionState,
    pub service_worker_active: bool,
    pub is_secure_context: bool,
    pub is_sandboxed: bool,
    /// 平台是否提供通知权限 API
    pub notifications_supported: bool,
}

impl ReadinessSnapshot {
    /// 第一次轮询之前使用的保守值
    pub fn unknown() -> Self {
        Self {
            permission: PermissionState::Default,
            service_worker_active: false,
            is_secure_context: false,
            is_sandboxed: false,
            notifications_supported: false,
        }
    }

    pub fn can_dispatch(&self) -> bool {
        self.permission == PermissionState::Granted
    }
}

/// 查询平台并生成快照，不会失败
pub async fn poll_platform(platform: &dyn NotificationPlatform) -> ReadinessSnapshot {
    let (permission, notifications_supported) = match platform.permission() {
        Ok(state) => (state, true),
        Err(e) => {
            debug!(error = %e, "Notification permission API unavailable");
            (PermissionState::Default, false)
        }
    };

    let mut is_sandboxed = platform.detect_sandbox().unwrap_or_else(|e| {
        warn!(error = %e, "Sandbox detection failed, assuming sandboxed");
        true
    });

    let service_worker_active = match platform.service_worker().await {
        Ok(registration) => registration.is_some(),
        Err(e) => {
            if e.kind == PlatformErrorKind::Security {
                is_sandboxed = true;
            }
            debug!(error = %e, "Service worker lookup failed");
            false
        }
    };

    ReadinessSnapshot {
        permission,
        service_worker_active,
        is_secure_context: platform.is_secure_context(),
        is_sandboxed,
        notifications_supported,
    }
}

struct MonitorInner {
    platform: Arc<dyn NotificationPlatform>,
    tx: Arc<watch::Sender<ReadinessSnapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().ok().and_then(|t| t.take()) {
            task.abort();
        }
    }
}

/// 状态监控器（可克隆，所有克隆共享同一份快照和定时器）
#[derive(Clone)]
pub struct StatusMonitor {
    inner: Arc<MonitorInner>,
}

impl StatusMonitor {
    pub fn new(platform: Arc<dyn NotificationPlatform>) -> Self {
        let (tx, _rx) = watch::channel(ReadinessSnapshot::unknown());
        Self {
            inner: Arc::new(MonitorInner {
                platform,
                tx: Arc::new(tx),
                task: Mutex::new(None),
            }),
        }
    }

    /// 查询平台状态，不发布
    pub async fn poll(&self) -> ReadinessSnapshot {
        poll_platform(self.inner.platform.as_ref()).await
    }

    /// 立即轮询并发布
    pub async fn refresh(&self) -> ReadinessSnapshot {
        let snapshot = self.poll().await;
        self.inner.tx.send_replace(snapshot);
        snapshot
    }

    /// 最新发布的快照
    pub fn latest(&self) -> ReadinessSnapshot {
        *self.inner.tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ReadinessSnapshot> {
        self.inner.tx.subscribe()
    }

    /// 启动时轮询一次，然后按固定间隔轮询
    ///
    /// 间隔为零时使用 [`DEFAULT_POLL_INTERVAL`]。
    pub async fn start(&self, interval: Duration) -> ReadinessSnapshot {
        let interval = if interval.is_zero() {
            warn!("Zero poll interval, falling back to the default");
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };
        self.stop();
        let snapshot = self.refresh().await;

        let platform = Arc::clone(&self.inner.platform);
        let tx = Arc::clone(&self.inner.tx);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即完成，启动时已经轮询过
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = poll_platform(platform.as_ref()).await;
                if *tx.borrow() != snapshot {
                    debug!(?snapshot, "Readiness changed");
                }
                tx.send_replace(snapshot);
            }
        });

        *self.lock_task() = Some(handle);
        info!(interval_ms = interval.as_millis() as u64, "Status monitor started");
        snapshot
    }

    /// 停止定时轮询
    pub fn stop(&self) {
        if let Some(task) = self.lock_task().take() {
            task.abort();
            info!("Status monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_task()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}
