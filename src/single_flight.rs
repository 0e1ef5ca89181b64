//! Single-flight 合并 - 同一时间只发出一次平台调用
//!
//! 平台提示框不能重叠，订阅也不能被并发的第二次调用覆盖。
//! 进行中的调用被共享，后来的调用者等待同一个结果。

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// 进行中的调用
struct Flight<T> {
    id: u64,
    future: Shared<BoxFuture<'static, T>>,
}

pub struct SingleFlight<T: Clone> {
    name: &'static str,
    slot: Mutex<Option<Flight<T>>>,
    next_id: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// 有调用进行中时加入它，否则用 `start` 发起新调用
    pub async fn run<F, Fut>(&self, start: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (id, future) = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(flight) => {
                    debug!(flight = self.name, id = flight.id, "Joining in-flight call");
                    (flight.id, flight.future.clone())
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = start().boxed().shared();
                    *slot = Some(Flight {
                        id,
                        future: future.clone(),
                    });
                    (id, future)
                }
            }
        };

        let output = future.await;

        // 只清理自己等待的那一次调用
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map(|f| f.id) == Some(id) {
            *slot = None;
        }
        output
    }

    pub fn in_flight(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
