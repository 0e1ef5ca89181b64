//! 发送历史 - 固定容量、最新在前

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// 默认容量
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// 投递方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryMethod {
    /// 页面直接展示
    Local,
    /// 通过 Service Worker 展示
    ServiceWorker,
    /// 推送消息经 Service Worker 展示
    Remote,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMethod::Local => "local",
            DeliveryMethod::ServiceWorker => "serviceWorker",
            DeliveryMethod::Remote => "remote",
        }
    }
}

impl std::fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 历史记录条目，只在发送成功时创建
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub body: String,
    pub method: DeliveryMethod,
}

impl HistoryItem {
    pub fn new(title: impl Into<String>, body: impl Into<String>, method: DeliveryMethod) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            title: title.into(),
            body: body.into(),
            method,
        }
    }
}

/// 历史记录环形缓冲
#[derive(Debug, Clone)]
pub struct HistoryLog {
    items: VecDeque<HistoryItem>,
    capacity: usize,
}

/// 在 harness 各组件之间共享的历史
pub type SharedHistory = Arc<Mutex<HistoryLog>>;

impl HistoryLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn shared(capacity: usize) -> SharedHistory {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    /// 插入到最前面，超出容量时静默丢弃最旧的
    pub fn append(&mut self, item: HistoryItem) {
        self.items.push_front(item);
        self.items.truncate(self.capacity);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn items(&self) -> Vec<HistoryItem> {
        self.items.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&HistoryItem> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
