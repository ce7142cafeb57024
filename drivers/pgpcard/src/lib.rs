//! PgpCardG3 驱动
//!
//! PGP 多通道 PCIe 桥接卡的字符设备驱动：固定数量的 DMA 缓冲区在中断处理器与阻塞调用者之间
//! 通过两个单生产者/单消费者环形队列流转，TX 队列存放空闲缓冲区，RX 队列存放已填充的缓冲区。

pub mod completion;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod memory;
pub mod pool;
pub mod regs;
pub mod registry;
pub mod status;
pub mod transfer;
pub mod window;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use pgpcard_protocol as protocol;

pub use completion::{AsyncNotify, IrqReturn};
pub use config::PgpCardConfig;
pub use control::{ControlReply, Diagnostics};
pub use device::{DeviceResources, PgpCard};
pub use error::{PgpError, PgpResult};
pub use memory::{CallerMemory, LocalMemory};
pub use registry::DeviceRegistry;
pub use transfer::{Interrupter, OpenFlags, RxFrame, Session};
pub use window::{RegisterWindow, WindowAccess};

/// 模块名，也是设备名前缀
pub const MOD_NAME: &str = "PgpCardG3";

/// PCI 厂商号（SLAC）
pub const PCI_VENDOR_ID_SLAC: u16 = 0x1A4A;
/// PCI 设备号
pub const PCI_DEVICE_ID_PGPCARD: u16 = 0x2020;

/// 暂存寄存器自检值
pub const SPAD_WRITE: u32 = 0x5544_1122;
