//! 用户态驱动框架
//!
//! 提供寄存器访问、DMA 内存、中断线、无锁环形队列和等待队列。

#![allow(clippy::missing_safety_doc)]

pub mod dma;
pub mod errno;
pub mod irq;
pub mod mmio;
pub mod ring;
pub mod wait_queue;

pub use dma::{AllocStats, DmaAllocator, DmaRegion, HostDmaAllocator, PhysAddr};
pub use irq::{IrqHandler, IrqLine};
pub use mmio::{MmioRegion, Register, RegisterBus};
pub use ring::{PushOutcome, SpscRing};
pub use wait_queue::{PendingSignal, PollFlags, WaitQueue};

/// 驱动错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// 无效参数
    InvalidArgument,
    /// 内存不足
    OutOfMemory,
    /// 连接断开
    Disconnected,
    /// 超时
    Timeout,
    /// 缓冲区太小
    BufferTooSmall,
    /// 设备忙
    DeviceBusy,
    /// IO 错误
    IoError,
    /// 不支持的操作
    NotSupported,
    /// 资源暂不可用（非阻塞模式）
    WouldBlock,
    /// 等待被取消信号打断
    Interrupted,
    /// 系统错误
    SystemError(i32),
}

impl DriverError {
    /// 对应的 errno
    pub fn errno(&self) -> i32 {
        match self {
            DriverError::InvalidArgument => errno::EINVAL,
            DriverError::OutOfMemory => errno::ENOMEM,
            DriverError::Disconnected => errno::EPIPE,
            DriverError::Timeout => errno::ETIMEDOUT,
            DriverError::BufferTooSmall => errno::EMSGSIZE,
            DriverError::DeviceBusy => errno::EBUSY,
            DriverError::IoError => errno::EIO,
            DriverError::NotSupported => errno::EOPNOTSUPP,
            DriverError::WouldBlock => errno::EAGAIN,
            DriverError::Interrupted => errno::ERESTARTSYS,
            DriverError::SystemError(errno) => *errno,
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => DriverError::SystemError(errno),
            None => DriverError::IoError,
        }
    }
}

pub type Result<T> = core::result::Result<T, DriverError>;
