//! Service Worker 控制器 - 推送事件与通知点击
//!
//! 在进程内实现 Service Worker 一侧的约定：
//! - install 时跳过等待，activate 时立即接管所有客户端
//! - push 事件优先按 JSON 解析，失败时把文本当作正文，没有负载时使用默认标题和正文
//! - notificationclick 关闭通知，聚焦已有窗口，没有窗口时在根路径打开新窗口
//!
//! 负载格式错误或缺失都不会导致失败。

use chrono::Utc;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::PlatformError;
use crate::platform::{NotificationAction, NotificationRequest};

pub const DEFAULT_PUSH_TITLE: &str = "Push Lab Alert";
pub const DEFAULT_PUSH_BODY: &str = "Test notification received successfully!";

/// 生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Parsed,
    Installed,
    Activated,
}

/// 客户端窗口
#[derive(Debug, Clone, PartialEq)]
pub struct ClientWindow {
    pub id: u64,
    pub url: String,
    pub focused: bool,
    /// 是否受当前 Service Worker 控制
    pub controlled: bool,
}

/// 正在展示的通知
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayedNotification {
    pub id: u64,
    pub request: NotificationRequest,
}

/// 点击通知后的路由结果
#[derive(Debug, Clone, PartialEq)]
pub enum ClickOutcome {
    Focused { client_id: u64 },
    Opened { client_id: u64, url: String },
}

/// 推送负载（字段缺失时使用默认值）
#[derive(Debug, Deserialize)]
struct PushPayload {
    title: Option<String>,
    body: Option<String>,
}

#[derive(Debug)]
struct ControllerState {
    phase: LifecyclePhase,
    clients: Vec<ClientWindow>,
    displayed: Vec<DisplayedNotification>,
}

/// Service Worker 控制器
#[derive(Debug)]
pub struct ServiceWorkerController {
    origin: String,
    state: Mutex<ControllerState>,
    next_id: AtomicU64,
}

impl ServiceWorkerController {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            state: Mutex::new(ControllerState {
                phase: LifecyclePhase::Parsed,
                clients: Vec::new(),
                displayed: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// install 事件：不等待旧实例退出
    pub fn install(&self) {
        let mut state = self.lock();
        if state.phase == LifecyclePhase::Parsed {
            state.phase = LifecyclePhase::Installed;
            debug!("Service worker installed, skipping waiting");
        }
    }

    /// activate 事件：立即接管所有已打开的客户端
    pub fn activate(&self) {
        let mut state = self.lock();
        if state.phase == LifecyclePhase::Parsed {
            warn!("Activating a service worker that never installed");
        }
        state.phase = LifecyclePhase::Activated;
        for client in state.clients.iter_mut() {
            client.controlled = true;
        }
        info!(clients = state.clients.len(), "Service worker activated and claimed clients");
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.lock().phase
    }

    pub fn is_active(&self) -> bool {
        self.phase() == LifecyclePhase::Activated
    }

    /// 注册一个已打开的页面窗口
    pub fn attach_client(&self, url: impl Into<String>) -> u64 {
        let id = self.next_id();
        let mut state = self.lock();
        let controlled = state.phase == LifecyclePhase::Activated;
        state.clients.push(ClientWindow {
            id,
            url: url.into(),
            focused: false,
            controlled,
        });
        id
    }

    pub fn clients(&self) -> Vec<ClientWindow> {
        self.lock().clients.clone()
    }

    /// 展示通知，返回通知 ID
    pub fn show_notification(&self, request: NotificationRequest) -> Result<u64, PlatformError> {
        let id = self.next_id();
        let mut state = self.lock();
        if state.phase != LifecyclePhase::Activated {
            return Err(PlatformError::other(
                "No active service worker is available to show notifications",
            ));
        }
        debug!(id, title = %request.title, "Service worker showing notification");
        state.displayed.push(DisplayedNotification { id, request });
        Ok(id)
    }

    pub fn displayed(&self) -> Vec<DisplayedNotification> {
        self.lock().displayed.clone()
    }

    /// 关闭通知，返回它是否还在展示
    pub fn close_notification(&self, notification_id: u64) -> bool {
        let mut state = self.lock();
        let before = state.displayed.len();
        state.displayed.retain(|n| n.id != notification_id);
        state.displayed.len() != before
    }

    /// push 事件
    pub fn handle_push(&self, payload: Option<&[u8]>) -> Result<NotificationRequest, PlatformError> {
        let request = self.push_notification(payload);
        self.show_notification(request.clone())?;
        Ok(request)
    }

    /// 由推送负载生成要展示的通知，不展示
    pub fn push_notification(&self, payload: Option<&[u8]>) -> NotificationRequest {
        let (title, body) = parse_push_payload(payload);

        let mut request = NotificationRequest::new(title, body);
        request.icon = Some("https://picsum.photos/192/192?random=sw".to_string());
        request.badge = Some("https://picsum.photos/96/96?random=badge".to_string());
        request.vibrate = vec![100, 50, 100];
        request.data = Some(serde_json::json!({
            "url": self.origin,
            "timestamp": Utc::now().timestamp_millis(),
        }));
        request.actions = vec![NotificationAction {
            action: "open".to_string(),
            title: "Open App".to_string(),
        }];
        request
    }

    /// notificationclick 事件
    pub fn handle_notification_click(&self, notification_id: u64) -> ClickOutcome {
        if !self.close_notification(notification_id) {
            debug!(notification_id, "Clicked notification was already closed");
        }

        let new_id = self.next_id();
        let mut state = self.lock();

        if let Some(client) = state.clients.first_mut() {
            client.focused = true;
            let client_id = client.id;
            info!(client_id, "Focusing existing client window");
            return ClickOutcome::Focused { client_id };
        }

        let controlled = state.phase == LifecyclePhase::Activated;
        state.clients.push(ClientWindow {
            id: new_id,
            url: "/".to_string(),
            focused: true,
            controlled,
        });
        info!(client_id = new_id, "Opening new client window at /");
        ClickOutcome::Opened {
            client_id: new_id,
            url: "/".to_string(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 解析推送负载：JSON → 文本 → 默认值
fn parse_push_payload(payload: Option<&[u8]>) -> (String, String) {
    let bytes = match payload {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => return (DEFAULT_PUSH_TITLE.to_string(), DEFAULT_PUSH_BODY.to_string()),
    };

    match serde_json::from_slice::<PushPayload>(bytes) {
        Ok(parsed) => (
            parsed.title.unwrap_or_else(|| DEFAULT_PUSH_TITLE.to_string()),
            parsed.body.unwrap_or_else(|| DEFAULT_PUSH_BODY.to_string()),
        ),
        Err(e) => {
            debug!(error = %e, "Push payload is not JSON, using it as text");
            (
                DEFAULT_PUSH_TITLE.to_string(),
                String::from_utf8_lossy(bytes).into_owned(),
            )
        }
    }
}
