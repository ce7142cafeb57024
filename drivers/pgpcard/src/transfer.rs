//! 阻塞传输
//!
//! 一个 [`Session`] 对应一次打开。写调用从 TX 队列取空闲缓冲区，拷贝数据并提交描述符；
//! 读调用从 RX 队列取已填充的缓冲区，拷贝数据后把缓冲区还给硬件。
//! 队列为空时在对应的等待队列上阻塞，除非会话以 [`OpenFlags::NONBLOCK`] 打开。

use core::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use libdriver::{PollFlags, WaitQueue};
use log::{debug, info, warn};
use pgpcard_protocol::{
    Command, FrameFlags, PgpCardStatus, RxCompletion, RxRequest, TxRequest, LANE_COUNT, WORD_SIZE,
};

use crate::completion::AsyncNotify;
use crate::control::{self, ControlReply, Diagnostics};
use crate::device::Shared;
use crate::error::{PgpError, PgpResult};
use crate::memory::CallerMemory;
use crate::pool::FrameMeta;
use crate::regs::TxDescriptor;
use crate::window::{RegisterWindow, WindowAccess};

bitflags::bitflags! {
    /// 打开标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// 资源不可用时立即返回 [`PgpError::WouldBlock`]
        const NONBLOCK = 1 << 0;
    }
}

/// 一次接收的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxFrame {
    pub lane: u32,
    pub vc: u32,
    /// 帧的字数
    pub length: u32,
    /// 实际拷贝给调用者的字数
    pub copied: u32,
    pub flags: FrameFlags,
}

/// 打开的会话
pub struct Session {
    shared: Arc<Shared>,
    flags: OpenFlags,
}

impl Session {
    pub(crate) fn new(shared: Arc<Shared>, flags: OpenFlags) -> Self {
        if shared.debug() > 0 {
            debug!("{}: Open: flags={:?}", shared.name, flags);
        }
        Self { shared, flags }
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: OpenFlags) {
        self.flags = flags;
    }

    /// 处理一条写记录
    ///
    /// 普通写返回提交的字数；其他命令作为控制命令执行，`data` 字段是立即参数，
    /// 读状态命令把快照写到 `data` 指向的位置。
    pub fn write(&self, record: &[u8], memory: &dyn CallerMemory) -> PgpResult<usize> {
        let request = match TxRequest::decode(record) {
            Ok(request) => request,
            Err(e) => {
                warn!("{}: Write: {}", self.shared.name, e);
                return Err(e.into());
            }
        };

        match Command::from_code(request.cmd) {
            Some(Command::NormalWrite) => {
                self.submit(request.lane, request.vc, request.size, |payload| {
                    memory.read(request.data, payload)
                })
            }
            Some(command) => {
                if let ControlReply::Status(status) = self.control(command, request.data)? {
                    let bytes = status.to_record()?;
                    if let Err(e) = memory.write(request.data, &bytes) {
                        warn!("{}: Read Status: failed to copy to caller", self.shared.name);
                        return Err(e);
                    }
                }
                Ok(0)
            }
            None => {
                warn!("{}: Write: unknown command {:#x}", self.shared.name, request.cmd);
                Err(PgpError::UnknownCommand(request.cmd))
            }
        }
    }

    /// 处理一条读记录，应答按请求的布局写回 `record`，返回拷贝的字数
    pub fn read(&self, record: &mut [u8], memory: &dyn CallerMemory) -> PgpResult<usize> {
        let request = match RxRequest::decode(record) {
            Ok(request) => request,
            Err(e) => {
                warn!("{}: Read: {}", self.shared.name, e);
                return Err(e.into());
            }
        };

        let frame = self.receive(request.max_size, |payload| memory.write(request.data, payload))?;

        let reply = request.encode_reply(&RxCompletion {
            lane: frame.lane,
            vc: frame.vc,
            rx_size: frame.length,
            flags: frame.flags,
        })?;
        if reply.len() != record.len() {
            return Err(PgpError::RecordSize {
                expected: reply.len(),
                actual: record.len(),
            });
        }
        record.copy_from_slice(&reply);

        Ok(frame.copied as usize)
    }

    /// 发送一帧，返回提交的字数
    pub fn send(&self, lane: u32, vc: u32, data: &[u32]) -> PgpResult<usize> {
        let size = u32::try_from(data.len()).map_err(|_| PgpError::Oversize {
            bytes: data.len().saturating_mul(WORD_SIZE),
            capacity: self.shared.tx_pool.buffer_size(),
        })?;

        self.submit(lane, vc, size, |payload| {
            for (chunk, word) in payload.chunks_exact_mut(WORD_SIZE).zip(data) {
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            Ok(())
        })
    }

    /// 接收一帧，`data` 比帧短时截断并置长度错误标志
    pub fn recv(&self, data: &mut [u32]) -> PgpResult<RxFrame> {
        let max_size = u32::try_from(data.len()).unwrap_or(u32::MAX);

        self.receive(max_size, |payload| {
            for (word, chunk) in data.iter_mut().zip(payload.chunks_exact(WORD_SIZE)) {
                *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            Ok(())
        })
    }

    fn submit<F>(&self, lane: u32, vc: u32, size: u32, fill: F) -> PgpResult<usize>
    where
        F: FnOnce(&mut [u8]) -> PgpResult<()>,
    {
        let shared = &*self.shared;
        let bytes = size as usize * WORD_SIZE;
        let capacity = shared.tx_pool.buffer_size();

        // 超长请求在碰任何寄存器之前拒绝
        if bytes > capacity {
            warn!(
                "{}: Write: passed size is too large for TX buffer ({} > {})",
                shared.name, bytes, capacity
            );
            return Err(PgpError::Oversize { bytes, capacity });
        }

        let _consumer = Shared::lock_consumer(&shared.tx_consumer);
        self.wait_for(&shared.outq, || !shared.tx_free.is_empty())?;

        let Some(index) = shared.tx_free.peek() else {
            return Err(PgpError::WouldBlock);
        };
        let buffer = shared.tx_pool.buffer(index);

        // 拷贝失败时缓冲区仍留在空闲队列
        fill(unsafe { buffer.payload_mut(bytes) }?)?;

        buffer.set_meta(FrameMeta {
            lane,
            vc,
            length: size,
            flags: FrameFlags::empty(),
        });

        if (lane as usize) < LANE_COUNT {
            let desc = TxDescriptor {
                lane,
                vc,
                length: size,
            };
            shared.regs.tx_wr_a(lane as usize).write(desc.encode());
            shared.regs.tx_wr_b(lane as usize).write(buffer.dma_addr());
        } else {
            warn!("{}: Write: invalid lane {}, frame dropped", shared.name, lane);
        }

        shared.tx_free.pop();

        if shared.debug() > 1 {
            debug!(
                "{}: Write: Words={}, Lane={}, Vc={}, Addr={:#010x}",
                shared.name,
                size,
                lane,
                vc,
                buffer.dma_addr()
            );
        }

        Ok(size as usize)
    }

    fn receive<F>(&self, max_size: u32, drain: F) -> PgpResult<RxFrame>
    where
        F: FnOnce(&[u8]) -> PgpResult<()>,
    {
        let shared = &*self.shared;

        let _consumer = Shared::lock_consumer(&shared.rx_consumer);
        self.wait_for(&shared.inq, || !shared.rx_ready.is_empty())?;

        let Some(index) = shared.rx_ready.peek() else {
            return Err(PgpError::WouldBlock);
        };
        let buffer = shared.rx_pool.buffer(index);
        let meta = buffer.meta();

        // 硬件报告的长度不能超出缓冲区
        let capacity = u32::try_from(buffer.size() / WORD_SIZE).unwrap_or(u32::MAX);
        let mut flags = meta.flags;
        let mut copied = meta.length.min(capacity);
        if meta.length > max_size {
            warn!(
                "{}: Read: passed size is too small for RX frame ({} < {})",
                shared.name, max_size, meta.length
            );
            copied = copied.min(max_size);
            flags |= FrameFlags::LENGTH_ERR;
        }

        if !meta.flags.is_empty() {
            warn!(
                "{}: Read: error in frame. Lane={}, Vc={}, Flags={:?}",
                shared.name, meta.lane, meta.vc, meta.flags
            );
        }

        let bytes = copied as usize * WORD_SIZE;
        let copy = unsafe { buffer.payload(bytes) }.and_then(drain);

        // 拷贝是否成功，缓冲区都还给硬件
        shared
            .regs
            .rx_free(meta.lane as usize % LANE_COUNT)
            .write(buffer.dma_addr());
        shared.rx_ready.pop();

        if let Err(e) = copy {
            warn!("{}: Read: failed to copy frame to caller: {}", shared.name, e);
            return Err(e);
        }

        if shared.debug() > 1 {
            debug!(
                "{}: Read: Words={}, Lane={}, Vc={}, Addr={:#010x}",
                shared.name,
                copied,
                meta.lane,
                meta.vc,
                buffer.dma_addr()
            );
        }

        Ok(RxFrame {
            lane: meta.lane,
            vc: meta.vc,
            length: meta.length,
            copied,
            flags,
        })
    }

    /// 等待 `ready` 成立
    fn wait_for(&self, queue: &WaitQueue, ready: impl Fn() -> bool) -> PgpResult<()> {
        let shared = &*self.shared;

        if ready() {
            return Ok(());
        }
        if shared.is_detached() {
            return Err(PgpError::NoDevice);
        }
        if self.flags.contains(OpenFlags::NONBLOCK) {
            return Err(PgpError::WouldBlock);
        }

        if shared.debug() > 2 {
            debug!("{}: going to sleep", shared.name);
        }
        queue.wait_until(|| ready() || shared.is_detached(), &shared.signal)?;
        if shared.debug() > 2 {
            debug!("{}: woke up", shared.name);
        }

        if ready() {
            Ok(())
        } else {
            Err(PgpError::NoDevice)
        }
    }

    /// 当前就绪事件
    pub fn poll(&self) -> PollFlags {
        let mut flags = PollFlags::empty();
        flags.set(PollFlags::READABLE, !self.shared.rx_ready.is_empty());
        flags.set(PollFlags::WRITABLE, !self.shared.tx_free.is_empty());
        flags
    }

    /// 等待 `interest` 中任一事件就绪
    ///
    /// `timeout` 为 `None` 时一直等待；超时返回空集合。
    pub fn poll_wait(&self, interest: PollFlags, timeout: Option<Duration>) -> PgpResult<PollFlags> {
        let shared = &*self.shared;
        let ready = || self.poll().intersects(interest) || shared.is_detached();

        match timeout {
            None => shared.events.wait_until(ready, &shared.signal)?,
            Some(timeout) => {
                shared
                    .events
                    .wait_timeout_until(ready, &shared.signal, timeout)?;
            }
        }

        let flags = self.poll() & interest;
        if flags.is_empty() && shared.is_detached() {
            return Err(PgpError::NoDevice);
        }
        Ok(flags)
    }

    /// 取消本会话中正在阻塞的调用，被取消的调用返回 [`PgpError::Restart`]
    pub fn interrupt(&self) {
        self.shared.signal.raise();
        self.shared.wake_all();
    }

    /// 可以交给其他线程的取消句柄
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// 设置读就绪的异步通知，`None` 取消；会话关闭时自动取消
    pub fn set_async_notify(&self, notify: Option<Arc<dyn AsyncNotify>>) {
        if self.shared.debug() > 0 {
            debug!(
                "{}: Async: notify {}",
                self.shared.name,
                if notify.is_some() { "on" } else { "off" }
            );
        }
        *self.shared.notify.lock() = notify;
    }

    /// 映射 BAR0 寄存器窗口的前 `len` 字节
    pub fn map_registers(&self, len: usize, access: WindowAccess) -> PgpResult<RegisterWindow> {
        RegisterWindow::map(&self.shared, len, access)
    }

    /// 执行控制命令
    pub fn control(&self, command: Command, arg: u64) -> PgpResult<ControlReply> {
        control::execute(&self.shared, command, arg)
    }

    /// 状态快照
    pub fn status(&self) -> PgpCardStatus {
        self.shared.snapshot()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        control::diagnostics(&self.shared)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let shared = &*self.shared;
        let _consumer = Shared::lock_consumer(&shared.rx_consumer);

        {
            // 完成处理器此后不会再向 RX 队列放入缓冲区
            let _irq = shared.irq_lock.lock();
            shared.is_open.store(false, Ordering::Release);
        }

        // 未读的帧直接还给硬件
        let mut returned = 0;
        while let Some(index) = shared.rx_ready.pop() {
            let buffer = shared.rx_pool.buffer(index);
            shared
                .regs
                .rx_free(buffer.meta().lane as usize % LANE_COUNT)
                .write(buffer.dma_addr());
            returned += 1;
        }
        shared
            .counters
            .dropped_closed
            .fetch_add(returned, Ordering::Relaxed);

        shared.notify.lock().take();
        shared.signal.take();
        info!("{}: Close: {} unread frame(s) returned", shared.name, returned);
    }
}

/// 取消句柄
#[derive(Clone)]
pub struct Interrupter {
    shared: Weak<Shared>,
}

impl Interrupter {
    /// 取消会话中正在阻塞的调用；设备已释放时什么都不做
    pub fn interrupt(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.signal.raise();
            shared.wake_all();
        }
    }
}
