//! 取消令牌
//!
//! 基于 tokio_util 的 CancellationToken，额外维护回调列表：cancel 时依次执行且只执行一次；
//! 已取消后再注册的回调立即执行。取消是单调的，任何持有者都可取消，无人能撤销。

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

type Callback = Box<dyn FnOnce() + Send>;

/// 一次顶层调用派生出的所有投递共享同一个令牌
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
    callbacks: Arc<Mutex<Vec<Callback>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
        let callbacks = std::mem::take(
            &mut *self
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for callback in callbacks {
            callback();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// 等待取消（用于 select! 与长耗时调用竞争）
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }

    /// 注册取消回调；若已取消则立即在当前线程执行
    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let mut callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.is_cancelled() {
            drop(callbacks);
            callback();
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    /// 子令牌：父令牌取消时随之取消，子令牌取消不影响父令牌
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        let linked = child.clone();
        self.add_callback(move || linked.cancel());
        child
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}
