//! 中断处理

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::{DriverError, Result};

struct LineState {
    pending: u64,
    closed: bool,
}

/// 中断线
///
/// 平台的中断投递机制（VFIO eventfd、UIO 或模拟设备）通过 [`IrqLine::raise`] 通知驱动。
/// 在处理器取走之前到达的多次中断会合并。
pub struct IrqLine {
    irq_number: u32,
    state: Mutex<LineState>,
    cond: Condvar,
}

impl IrqLine {
    pub fn new(irq_number: u32) -> Self {
        Self {
            irq_number,
            state: Mutex::new(LineState {
                pending: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// 获取中断号
    pub fn irq_number(&self) -> u32 {
        self.irq_number
    }

    fn lock(&self) -> MutexGuard<'_, LineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 触发中断
    pub fn raise(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.pending += 1;
        self.cond.notify_one();
    }

    /// 等待中断，返回合并的中断次数
    pub fn wait(&self) -> Result<u64> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(DriverError::Disconnected);
            }
            if state.pending > 0 {
                return Ok(core::mem::take(&mut state.pending));
            }
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// 带超时等待中断
    pub fn wait_timeout(&self, timeout: Duration) -> Result<u64> {
        let state = self.lock();
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.closed && s.pending == 0)
            .unwrap_or_else(PoisonError::into_inner);

        if state.closed {
            return Err(DriverError::Disconnected);
        }
        if state.pending == 0 {
            return Err(DriverError::Timeout);
        }
        Ok(core::mem::take(&mut state.pending))
    }

    /// 关闭中断线，唤醒所有等待者
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// 中断处理器
///
/// 在专用线程中等待中断线并调用处理函数。
pub struct IrqHandler {
    line: Arc<IrqLine>,
    running: Arc<AtomicBool>,
}

impl IrqHandler {
    /// 创建中断处理器
    pub fn new(line: Arc<IrqLine>) -> Self {
        Self {
            line,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 中断线
    pub fn line(&self) -> &Arc<IrqLine> {
        &self.line
    }

    /// 运行中断处理循环
    pub fn run<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut() -> bool, // 返回 false 停止循环
    {
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            match self.line.wait() {
                Ok(_) => {}
                Err(DriverError::Disconnected) => break,
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }

            if !self.running.load(Ordering::SeqCst) || !handler() {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// 在新线程中运行处理循环
    pub fn spawn<F>(self: &Arc<Self>, name: String, handler: F) -> Result<JoinHandle<()>>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let this = self.clone();

        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            if let Err(e) = this.run(handler) {
                log::error!("{}: interrupt loop failed: {:?}", name, e);
            }
        });

        spawned.map_err(DriverError::from)
    }

    /// 停止处理循环
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // 关闭中断线以唤醒等待中的循环
        self.line.close();
    }

    /// 获取运行状态
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn raises_coalesce_until_taken() {
        let line = IrqLine::new(11);
        line.raise();
        line.raise();
        assert_eq!(line.wait().unwrap(), 2);
        assert_eq!(
            line.wait_timeout(Duration::from_millis(10)),
            Err(DriverError::Timeout)
        );
    }

    #[test]
    fn closed_line_disconnects_waiters() {
        let line = Arc::new(IrqLine::new(3));
        let waiter = {
            let line = line.clone();
            thread::spawn(move || line.wait())
        };
        thread::sleep(Duration::from_millis(20));
        line.close();
        assert_eq!(waiter.join().unwrap(), Err(DriverError::Disconnected));

        line.raise();
        assert!(line.is_closed());
    }

    #[test]
    fn handler_thread_runs_until_stopped() {
        let line = Arc::new(IrqLine::new(5));
        let handler = Arc::new(IrqHandler::new(line.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        let worker = {
            let calls = calls.clone();
            handler
                .spawn("irq-test".into(), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    true
                })
                .unwrap()
        };

        line.raise();
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handler.is_running());

        handler.stop();
        worker.join().unwrap();
        assert!(!handler.is_running());
    }
}
