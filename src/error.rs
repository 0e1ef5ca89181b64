//! 错误分类 - 所有组件对外只暴露 `HarnessError`
//!
//! 平台层返回 [`PlatformError`]，各组件在边界处转换成 `HarnessError`，
//! 原始平台错误不会越过组件的公开接口。

use std::sync::Mutex;
use tracing::debug;

/// 错误大类（用户可见的处理策略按大类区分）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 运行时缺少 API，只影响对应功能
    CapabilityMissing,
    /// 用户拒绝，只能由用户在平台设置中恢复，不自动重试
    PermissionDenied,
    /// 权限 API 存在，但提示本身失败
    PermissionPrompt,
    /// 发送前置条件不满足，可以通过请求权限恢复
    PermissionRequired,
    /// 跨域沙箱阻止了 Service Worker，触发模拟订阅
    SandboxRestricted,
    /// 应用服务器密钥格式错误
    KeyFormat,
    /// 订阅失败
    Subscription,
    /// 发送失败
    Dispatch,
    /// 指南生成失败
    Guidance,
}

/// Harness 统一错误类型
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HarnessError {
    /// 平台完全不支持通知权限 API（不是用户拒绝）
    #[error("notification permission API is not available: {0}")]
    PermissionRequest(String),

    /// 提示框没有给出结果（被导航打断等）
    #[error("failed to request notification permissions: {0}")]
    PermissionPrompt(String),

    #[error("notification permission was denied; re-enable it in the browser site settings")]
    PermissionDenied,

    #[error("please grant notification permissions first")]
    PermissionRequired,

    #[error("service worker access is blocked in this sandboxed context")]
    SandboxRestricted,

    #[error("invalid application server key: {0}")]
    KeyFormat(String),

    #[error("push subscription failed: {0}")]
    Subscription(String),

    #[error("notification failed: {0}")]
    Dispatch(String),

    /// 已有一个延迟发送在等待
    #[error("a delayed notification is already scheduled")]
    DispatchPending,

    /// 指南生成失败，不影响发送能力
    #[error("guidance generation failed: {0}")]
    Guidance(String),
}

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::PermissionRequest(_) => ErrorKind::CapabilityMissing,
            HarnessError::PermissionPrompt(_) => ErrorKind::PermissionPrompt,
            HarnessError::PermissionDenied => ErrorKind::PermissionDenied,
            HarnessError::PermissionRequired => ErrorKind::PermissionRequired,
            HarnessError::SandboxRestricted => ErrorKind::SandboxRestricted,
            HarnessError::KeyFormat(_) => ErrorKind::KeyFormat,
            HarnessError::Subscription(_) => ErrorKind::Subscription,
            HarnessError::Dispatch(_) | HarnessError::DispatchPending => ErrorKind::Dispatch,
            HarnessError::Guidance(_) => ErrorKind::Guidance,
        }
    }
}

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

/// 平台错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorKind {
    /// API 不存在
    Unsupported,
    /// 安全限制（非安全上下文、跨域沙箱）
    Security,
    /// 用户或平台拒绝
    NotAllowed,
    /// 推送服务不可达
    Network,
    Other,
}

/// 平台调用失败（只在平台 trait 与组件之间流动）
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct PlatformError {
    pub kind: PlatformErrorKind,
    pub message: String,
}

impl PlatformError {
    pub fn new(kind: PlatformErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorKind::Unsupported, message)
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorKind::Security, message)
    }

    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorKind::NotAllowed, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorKind::Network, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorKind::Other, message)
    }
}

/// 当前用户可见的错误信息，每次失败整体替换
#[derive(Debug, Default)]
pub struct LastError {
    message: Mutex<Option<String>>,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, error: &HarnessError) {
        let text = error.to_string();
        debug!(error = %text, "Recording user-visible error");
        *self.lock() = Some(text);
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn get(&self) -> Option<String> {
        self.lock().clone()
    }

    /// 记录 Err 并原样返回结果
    pub fn track<T>(&self, result: HarnessResult<T>) -> HarnessResult<T> {
        if let Err(e) = &result {
            self.set(e);
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.message.lock().unwrap_or_else(|e| e.into_inner())
    }
}
