//! 通知权限状态机
//!
//! default → granted | denied，只能由用户触发的请求推进。
//! denied 由平台保持，harness 只检测不覆盖。

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::{HarnessError, HarnessResult, PlatformError, PlatformErrorKind};
use crate::platform::NotificationPlatform;
use crate::single_flight::SingleFlight;
use crate::status::StatusMonitor;

/// 平台报告的通知权限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    #[default]
    Default,
    Granted,
    Denied,
}

impl PermissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionState::Default => "default",
            PermissionState::Granted => "granted",
            PermissionState::Denied => "denied",
        }
    }
}

impl std::fmt::Display for PermissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 权限控制器
pub struct PermissionController {
    platform: Arc<dyn NotificationPlatform>,
    monitor: StatusMonitor,
    last_known: Mutex<Option<PermissionState>>,
    flight: SingleFlight<HarnessResult<PermissionState>>,
}

impl PermissionController {
    pub fn new(platform: Arc<dyn NotificationPlatform>, monitor: StatusMonitor) -> Self {
        Self {
            platform,
            monitor,
            last_known: Mutex::new(None),
            flight: SingleFlight::new("permission"),
        }
    }

    /// 请求权限
    ///
    /// 已经是 granted 或 denied 时不会再弹出提示；并发调用共享同一次提示的结果。
    /// 平台没有权限 API 时返回 `PermissionRequest`，与用户拒绝区分开。
    pub async fn request_permission(&self) -> HarnessResult<PermissionState> {
        let current = self.platform.permission().map_err(request_error)?;

        let outcome = match current {
            PermissionState::Granted => Ok(PermissionState::Granted),
            PermissionState::Denied => {
                warn!("Notification permission is denied; only the user can reset it");
                Ok(PermissionState::Denied)
            }
            PermissionState::Default => {
                let platform = Arc::clone(&self.platform);
                self.flight
                    .run(move || async move {
                        let state = platform.request_permission().await.map_err(request_error)?;
                        info!(permission = %state, "Permission prompt answered");
                        Ok(state)
                    })
                    .await
            }
        };

        if let Ok(state) = &outcome {
            *self.last_known.lock().unwrap_or_else(|e| e.into_inner()) = Some(*state);
            self.monitor.refresh().await;
        }
        outcome
    }

    /// 最近一次观察到的权限（请求结果或最新快照）
    pub fn current(&self) -> PermissionState {
        let cached = *self.last_known.lock().unwrap_or_else(|e| e.into_inner());
        match self.platform.permission() {
            Ok(state) => state,
            Err(_) => cached.unwrap_or(self.monitor.latest().permission),
        }
    }

    pub fn is_requesting(&self) -> bool {
        self.flight.in_flight()
    }
}

fn request_error(error: PlatformError) -> HarnessError {
    match error.kind {
        PlatformErrorKind::Unsupported => HarnessError::PermissionRequest(error.message),
        _ => HarnessError::PermissionPrompt(error.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{LabEnvironment, LabPlatform};
    use std::time::Duration;

    fn controller(env: LabEnvironment) -> (Arc<LabPlatform>, PermissionController) {
        let platform = Arc::new(LabPlatform::new(env));
        let monitor = StatusMonitor::new(platform.clone());
        let controller = PermissionController::new(platform.clone(), monitor);
        (platform, controller)
    }

    #[test]
    fn test_permission_state_serde_lowercase() {
        assert_eq!(serde_json::to_string(&PermissionState::Granted).unwrap(), "\"granted\"");
        let parsed: PermissionState = serde_json::from_str("\"denied\"").unwrap();
        assert_eq!(parsed, PermissionState::Denied);
    }

    #[tokio::test]
    async fn test_request_grants() {
        let (platform, controller) = controller(LabEnvironment::default());
        assert_eq!(controller.current(), PermissionState::Default);

        let state = controller.request_permission().await.unwrap();

        assert_eq!(state, PermissionState::Granted);
        assert_eq!(controller.current(), PermissionState::Granted);
        assert_eq!(platform.prompt_count(), 1);
    }

    #[tokio::test]
    async fn test_user_denial_is_not_an_error() {
        let env = LabEnvironment {
            prompt_answer: PermissionState::Denied,
            ..LabEnvironment::default()
        };
        let (_, controller) = controller(env);
        assert_eq!(controller.request_permission().await.unwrap(), PermissionState::Denied);
    }

    #[tokio::test]
    async fn test_denied_is_sticky_and_never_reprompts() {
        let env = LabEnvironment {
            initial_permission: PermissionState::Denied,
            ..LabEnvironment::default()
        };
        let (platform, controller) = controller(env);

        assert_eq!(controller.request_permission().await.unwrap(), PermissionState::Denied);
        assert_eq!(controller.request_permission().await.unwrap(), PermissionState::Denied);
        assert_eq!(platform.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_api_is_capability_error() {
        let env = LabEnvironment {
            notifications_supported: false,
            ..LabEnvironment::default()
        };
        let (_, controller) = controller(env);

        let err = controller.request_permission().await.unwrap_err();
        assert!(matches!(err, HarnessError::PermissionRequest(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::CapabilityMissing);
    }

    /// 权限 API 存在，但提示框被打断
    struct InterruptedPrompt;

    #[async_trait::async_trait]
    impl NotificationPlatform for InterruptedPrompt {
        fn permission(&self) -> Result<PermissionState, PlatformError> {
            Ok(PermissionState::Default)
        }

        async fn request_permission(&self) -> Result<PermissionState, PlatformError> {
            Err(PlatformError::other("prompt was dismissed by a navigation"))
        }

        fn is_secure_context(&self) -> bool {
            true
        }

        fn detect_sandbox(&self) -> Result<bool, PlatformError> {
            Ok(false)
        }

        async fn service_worker(
            &self,
        ) -> Result<Option<Arc<dyn crate::platform::ServiceWorkerRegistration>>, PlatformError>
        {
            Ok(None)
        }

        async fn show_notification(
            &self,
            _request: &crate::platform::NotificationRequest,
        ) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_prompt_is_not_a_missing_api() {
        let platform: Arc<dyn NotificationPlatform> = Arc::new(InterruptedPrompt);
        let controller =
            PermissionController::new(Arc::clone(&platform), StatusMonitor::new(platform));

        let err = controller.request_permission().await.unwrap_err();

        assert_eq!(
            err,
            HarnessError::PermissionPrompt("prompt was dismissed by a navigation".to_string())
        );
        assert_eq!(err.kind(), crate::error::ErrorKind::PermissionPrompt);
        assert!(err.to_string().starts_with("failed to request notification permissions"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_prompt() {
        let (platform, controller) = controller(LabEnvironment::default());
        platform.set_prompt_delay(Duration::from_millis(50));

        let (a, b) = tokio::join!(controller.request_permission(), controller.request_permission());

        assert_eq!(a.unwrap(), PermissionState::Granted);
        assert_eq!(b.unwrap(), PermissionState::Granted);
        assert_eq!(platform.prompt_count(), 1);
    }
}
