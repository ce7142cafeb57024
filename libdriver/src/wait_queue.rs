//! 等待队列

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::{DriverError, Result};

bitflags::bitflags! {
    /// poll 事件
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollFlags: u32 {
        /// 有数据可读
        const READABLE = 1 << 0;
        /// 可以写入
        const WRITABLE = 1 << 1;
    }
}

/// 挂起的取消信号
///
/// 被触发后，下一次检查它的等待会以 [`DriverError::Interrupted`] 返回，信号随之被消耗。
#[derive(Debug, Default)]
pub struct PendingSignal(AtomicBool);

impl PendingSignal {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// 触发信号
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// 取走信号
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    /// 是否有挂起的信号
    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 等待队列
///
/// 唤醒方先更新条件，再调用 `wake_*`；等待方在持有内部锁时检查条件，因此不会丢失唤醒。
pub struct WaitQueue {
    /// 等待者数量
    waiters: Mutex<usize>,
    cond: Condvar,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 条件等待
    ///
    /// 条件满足时返回 `Ok(())`；等待期间 `signal` 被触发时返回 `Err(Interrupted)`。
    pub fn wait_until<F>(&self, mut condition: F, signal: &PendingSignal) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let mut waiters = self.lock();
        loop {
            if condition() {
                return Ok(());
            }
            if signal.take() {
                return Err(DriverError::Interrupted);
            }

            *waiters += 1;
            waiters = self.cond.wait(waiters).unwrap_or_else(PoisonError::into_inner);
            *waiters -= 1;
        }
    }

    /// 带超时的条件等待，超时返回 `Ok(false)`
    pub fn wait_timeout_until<F>(
        &self,
        mut condition: F,
        signal: &PendingSignal,
        timeout: Duration,
    ) -> Result<bool>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut waiters = self.lock();
        loop {
            if condition() {
                return Ok(true);
            }
            if signal.take() {
                return Err(DriverError::Interrupted);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }

            *waiters += 1;
            let (guard, _) = self
                .cond
                .wait_timeout(waiters, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            waiters = guard;
            *waiters -= 1;
        }
    }

    /// 唤醒一个等待者
    pub fn wake_one(&self) -> bool {
        let waiters = self.lock();
        self.cond.notify_one();
        *waiters > 0
    }

    /// 唤醒所有等待者，返回被唤醒的数量
    pub fn wake_all(&self) -> usize {
        let waiters = self.lock();
        self.cond.notify_all();
        *waiters
    }

    /// 是否有等待者
    pub fn has_waiters(&self) -> bool {
        *self.lock() > 0
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn wait_for_waiter(queue: &WaitQueue) {
        for _ in 0..400 {
            if queue.has_waiters() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no waiter showed up");
    }

    #[test]
    fn condition_already_true_returns_immediately() {
        let queue = WaitQueue::new();
        let signal = PendingSignal::new();
        assert_eq!(queue.wait_until(|| true, &signal), Ok(()));
        assert!(!queue.has_waiters());
    }

    #[test]
    fn wake_after_condition_change() {
        let queue = Arc::new(WaitQueue::new());
        let signal = Arc::new(PendingSignal::new());
        let ready = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let (queue, signal, ready) = (queue.clone(), signal.clone(), ready.clone());
            thread::spawn(move || queue.wait_until(|| ready.load(Ordering::SeqCst) > 0, &signal))
        };

        wait_for_waiter(&queue);
        ready.store(1, Ordering::SeqCst);
        assert_eq!(queue.wake_all(), 1);
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn signal_interrupts_wait() {
        let queue = Arc::new(WaitQueue::new());
        let signal = Arc::new(PendingSignal::new());

        let waiter = {
            let (queue, signal) = (queue.clone(), signal.clone());
            thread::spawn(move || queue.wait_until(|| false, &signal))
        };

        wait_for_waiter(&queue);
        signal.raise();
        queue.wake_all();
        assert_eq!(waiter.join().unwrap(), Err(DriverError::Interrupted));
        assert!(!signal.is_pending());
    }

    #[test]
    fn timeout_expires() {
        let queue = WaitQueue::new();
        let signal = PendingSignal::new();
        let started = Instant::now();
        assert_eq!(
            queue.wait_timeout_until(|| false, &signal, Duration::from_millis(30)),
            Ok(false)
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
