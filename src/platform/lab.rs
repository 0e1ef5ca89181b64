//! 实验室平台 - 进程内的浏览器环境
//!
//! 环境不是探测出来的，而是由配置决定：是否沙箱、是否安全上下文、
//! 有没有 Service Worker、用户会如何回答权限提示。测试和 CLI 都用它。
//! 所有状态都可以在运行中修改，用来模拟用户在浏览器设置里的操作。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    DisplayCommand, NotificationPlatform, NotificationRequest, ServiceWorkerRegistration,
    SubscribeOptions,
};
use crate::error::PlatformError;
use crate::key_codec::encode_url_safe;
use crate::permission::PermissionState;
use crate::service_worker::ServiceWorkerController;
use crate::subscription::{SubscriptionData, SubscriptionKeys};

/// 实验室推送服务地址
pub const LAB_PUSH_SERVICE: &str = "https://push-service.lab.local/wpush/v2";

/// 实验室环境配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabEnvironment {
    /// 是否提供通知权限 API
    pub notifications_supported: bool,
    pub secure_context: bool,
    /// 跨域 iframe 嵌入
    pub sandboxed: bool,
    /// 是否注册了 Service Worker
    pub service_worker: bool,
    pub initial_permission: PermissionState,
    /// 权限提示的回答
    pub prompt_answer: PermissionState,
    pub push_service_reachable: bool,
    pub origin: String,
}

impl Default for LabEnvironment {
    fn default() -> Self {
        Self {
            notifications_supported: true,
            secure_context: true,
            sandboxed: false,
            service_worker: true,
            initial_permission: PermissionState::Default,
            prompt_answer: PermissionState::Granted,
            push_service_reachable: true,
            origin: "https://push-lab.local".to_string(),
        }
    }
}

/// 通知在哪里展示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplaySurface {
    /// 页面直接展示
    Page,
    /// 页面请求 Service Worker 展示
    ServiceWorker,
    /// 推送事件触发
    Push,
}

/// 已展示的通知记录
#[derive(Debug, Clone, PartialEq)]
pub struct ShownNotification {
    pub surface: DisplaySurface,
    pub request: NotificationRequest,
}

struct LabShared {
    env: Mutex<LabEnvironment>,
    permission: Mutex<PermissionState>,
    controller: Arc<ServiceWorkerController>,
    display: Option<DisplayCommand>,
    shown: Mutex<Vec<ShownNotification>>,
    issued: Mutex<Vec<SubscriptionData>>,
    display_failure: Mutex<Option<PlatformError>>,
    prompt_delay: Mutex<Duration>,
    subscribe_delay: Mutex<Duration>,
    sandbox_probe_fails: AtomicBool,
    prompts: AtomicUsize,
    subscribes: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl LabShared {
    fn env(&self) -> LabEnvironment {
        lock(&self.env).clone()
    }

    fn permission(&self) -> PermissionState {
        *lock(&self.permission)
    }

    fn take_display_failure(&self) -> Option<PlatformError> {
        lock(&self.display_failure).take()
    }

    async fn present(
        &self,
        surface: DisplaySurface,
        request: &NotificationRequest,
    ) -> Result<(), PlatformError> {
        if let Some(display) = &self.display {
            display.show(request).await?;
        }
        debug!(?surface, title = %request.title, "Lab notification shown");
        lock(&self.shown).push(ShownNotification {
            surface,
            request: request.clone(),
        });
        Ok(())
    }

    /// 由 Service Worker 展示；展示命令失败时撤回通知
    async fn present_via_worker(
        &self,
        surface: DisplaySurface,
        request: &NotificationRequest,
    ) -> Result<(), PlatformError> {
        let id = self.controller.show_notification(request.clone())?;
        if let Err(e) = self.present(surface, request).await {
            self.controller.close_notification(id);
            return Err(e);
        }
        Ok(())
    }
}

/// 进程内平台实现
#[derive(Clone)]
pub struct LabPlatform {
    shared: Arc<LabShared>,
}

impl LabPlatform {
    pub fn new(env: LabEnvironment) -> Self {
        Self::build(env, None)
    }

    /// 直接展示和 Service Worker 展示同时交给外部命令
    pub fn with_display_command(env: LabEnvironment, display: DisplayCommand) -> Self {
        Self::build(env, Some(display))
    }

    fn build(env: LabEnvironment, display: Option<DisplayCommand>) -> Self {
        let controller = Arc::new(ServiceWorkerController::new(env.origin.clone()));
        controller.attach_client(format!("{}/", env.origin));
        if env.service_worker {
            controller.install();
            controller.activate();
        }

        let permission = env.initial_permission;
        Self {
            shared: Arc::new(LabShared {
                env: Mutex::new(env),
                permission: Mutex::new(permission),
                controller,
                display,
                shown: Mutex::new(Vec::new()),
                issued: Mutex::new(Vec::new()),
                display_failure: Mutex::new(None),
                prompt_delay: Mutex::new(Duration::ZERO),
                subscribe_delay: Mutex::new(Duration::ZERO),
                sandbox_probe_fails: AtomicBool::new(false),
                prompts: AtomicUsize::new(0),
                subscribes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn environment(&self) -> LabEnvironment {
        self.shared.env()
    }

    /// 在平台外部修改权限（模拟用户在浏览器设置里操作）
    pub fn set_permission(&self, state: PermissionState) {
        info!(permission = %state, "Lab permission changed out of band");
        *lock(&self.shared.permission) = state;
    }

    pub fn set_sandboxed(&self, sandboxed: bool) {
        lock(&self.shared.env).sandboxed = sandboxed;
    }

    pub fn set_secure_context(&self, secure: bool) {
        lock(&self.shared.env).secure_context = secure;
    }

    /// 注册或注销 Service Worker
    pub fn set_service_worker(&self, registered: bool) {
        lock(&self.shared.env).service_worker = registered;
        if registered && !self.shared.controller.is_active() {
            self.shared.controller.install();
            self.shared.controller.activate();
        }
    }

    pub fn set_push_service_reachable(&self, reachable: bool) {
        lock(&self.shared.env).push_service_reachable = reachable;
    }

    pub fn set_prompt_delay(&self, delay: Duration) {
        *lock(&self.shared.prompt_delay) = delay;
    }

    pub fn set_subscribe_delay(&self, delay: Duration) {
        *lock(&self.shared.subscribe_delay) = delay;
    }

    pub fn set_sandbox_probe_fails(&self, fails: bool) {
        self.shared.sandbox_probe_fails.store(fails, Ordering::SeqCst);
    }

    /// 下一次展示（任意路径）失败
    pub fn fail_next_display(&self, error: PlatformError) {
        *lock(&self.shared.display_failure) = Some(error);
    }

    pub fn prompt_count(&self) -> usize {
        self.shared.prompts.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> usize {
        self.shared.subscribes.load(Ordering::SeqCst)
    }

    pub fn shown(&self) -> Vec<ShownNotification> {
        lock(&self.shared.shown).clone()
    }

    pub fn controller(&self) -> Arc<ServiceWorkerController> {
        Arc::clone(&self.shared.controller)
    }
}

#[async_trait]
impl NotificationPlatform for LabPlatform {
    fn permission(&self) -> Result<PermissionState, PlatformError> {
        if !self.shared.env().notifications_supported {
            return Err(PlatformError::unsupported(
                "This browser does not support desktop notifications.",
            ));
        }
        Ok(self.shared.permission())
    }

    async fn request_permission(&self) -> Result<PermissionState, PlatformError> {
        let env = self.shared.env();
        if !env.notifications_supported {
            return Err(PlatformError::unsupported(
                "This browser does not support desktop notifications.",
            ));
        }

        self.shared.prompts.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.shared.prompt_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut permission = lock(&self.shared.permission);
        if *permission == PermissionState::Default {
            *permission = env.prompt_answer;
        }
        Ok(*permission)
    }

    fn is_secure_context(&self) -> bool {
        self.shared.env().secure_context
    }

    fn detect_sandbox(&self) -> Result<bool, PlatformError> {
        if self.shared.sandbox_probe_fails.load(Ordering::SeqCst) {
            return Err(PlatformError::security(
                "Blocked a frame from accessing a cross-origin frame.",
            ));
        }
        Ok(self.shared.env().sandboxed)
    }

    async fn service_worker(
        &self,
    ) -> Result<Option<Arc<dyn ServiceWorkerRegistration>>, PlatformError> {
        let env = self.shared.env();
        if env.sandboxed {
            return Err(PlatformError::security(
                "Failed to get service worker registration: The operation is insecure.",
            ));
        }
        if !env.service_worker || !env.secure_context || !self.shared.controller.is_active() {
            return Ok(None);
        }
        Ok(Some(Arc::new(LabRegistration {
            shared: Arc::clone(&self.shared),
        })))
    }

    async fn show_notification(&self, request: &NotificationRequest) -> Result<(), PlatformError> {
        if let Some(error) = self.shared.take_display_failure() {
            return Err(error);
        }
        let env = self.shared.env();
        if !env.notifications_supported {
            return Err(PlatformError::unsupported(
                "Notification constructor is not available",
            ));
        }
        if !env.secure_context {
            return Err(PlatformError::security(
                "Notifications are only available in secure contexts (HTTPS)",
            ));
        }
        if self.shared.permission() != PermissionState::Granted {
            return Err(PlatformError::not_allowed(
                "No notification permission has been granted for this origin",
            ));
        }
        self.shared.present(DisplaySurface::Page, request).await
    }
}

/// 实验室 Service Worker registration
struct LabRegistration {
    shared: Arc<LabShared>,
}

#[async_trait]
impl ServiceWorkerRegistration for LabRegistration {
    async fn show_notification(&self, request: &NotificationRequest) -> Result<(), PlatformError> {
        if let Some(error) = self.shared.take_display_failure() {
            return Err(error);
        }
        if !self.shared.env().secure_context {
            return Err(PlatformError::security(
                "showNotification requires a secure context (HTTPS)",
            ));
        }
        if self.shared.permission() != PermissionState::Granted {
            return Err(PlatformError::not_allowed(
                "No notification permission has been granted for this origin",
            ));
        }
        self.shared
            .present_via_worker(DisplaySurface::ServiceWorker, request)
            .await
    }

    async fn subscribe(
        &self,
        options: &SubscribeOptions,
    ) -> Result<SubscriptionData, PlatformError> {
        self.shared.subscribes.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.shared.subscribe_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !options.user_visible_only {
            return Err(PlatformError::not_allowed(
                "Push subscriptions without userVisibleOnly are not supported",
            ));
        }
        if self.shared.permission() != PermissionState::Granted {
            return Err(PlatformError::not_allowed("Registration failed - permission denied"));
        }
        if !self.shared.env().push_service_reachable {
            return Err(PlatformError::network("Registration failed - push service error"));
        }
        let key = &options.application_server_key;
        if key.len() != 65 || key[0] != 0x04 {
            return Err(PlatformError::other(
                "The provided applicationServerKey is not valid.",
            ));
        }

        let data = mint_subscription();
        info!(endpoint = %data.endpoint, "Lab push subscription created");
        lock(&self.shared.issued).push(data.clone());
        Ok(data)
    }

    async fn deliver_push(
        &self,
        subscription: &SubscriptionData,
        payload: Option<Vec<u8>>,
    ) -> Result<NotificationRequest, PlatformError> {
        let known = lock(&self.shared.issued)
            .iter()
            .any(|s| s.endpoint == subscription.endpoint);
        if !known {
            return Err(PlatformError::other(format!(
                "push service does not know endpoint {}",
                subscription.endpoint
            )));
        }

        let request = self.shared.controller.push_notification(payload.as_deref());
        self.shared
            .present_via_worker(DisplaySurface::Push, &request)
            .await?;
        Ok(request)
    }
}

/// 生成订阅：端点 + P-256 公钥形状的 p256dh + 16 字节 auth
fn mint_subscription() -> SubscriptionData {
    let mut p256dh = Vec::with_capacity(65);
    p256dh.push(0x04);
    for _ in 0..4 {
        p256dh.extend_from_slice(Uuid::new_v4().as_bytes());
    }

    SubscriptionData {
        endpoint: format!("{}/{}", LAB_PUSH_SERVICE, Uuid::new_v4().simple()),
        keys: SubscriptionKeys {
            p256dh: encode_url_safe(&p256dh),
            auth: encode_url_safe(Uuid::new_v4().as_bytes()),
        },
    }
}
