//! 驱动配置

use crate::error::{PgpError, PgpResult};
use crate::regs::{rx_max_frame, tx_desc};

/// 默认 TX 缓冲区大小（字节）
pub const DEF_TX_BUF_SIZE: usize = 0x20_0000;
/// 默认 RX 缓冲区大小（字节）
pub const DEF_RX_BUF_SIZE: usize = 0x20_0000;
/// 默认 TX 缓冲区数量
pub const DEF_TX_BUF_CNT: usize = 32;
/// 默认 RX 缓冲区数量
pub const DEF_RX_BUF_CNT: usize = 32;
/// 默认最大设备数
pub const MAX_PCI_DEVICES: usize = 8;

/// 驱动配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgpCardConfig {
    pub tx_buffer_count: usize,
    /// 字节
    pub tx_buffer_size: usize,
    pub rx_buffer_count: usize,
    /// 字节
    pub rx_buffer_size: usize,
    /// 新设备的初始调试级别
    pub debug: u32,
    /// 注册表槽位数
    pub max_devices: usize,
}

impl Default for PgpCardConfig {
    fn default() -> Self {
        Self {
            tx_buffer_count: DEF_TX_BUF_CNT,
            tx_buffer_size: DEF_TX_BUF_SIZE,
            rx_buffer_count: DEF_RX_BUF_CNT,
            rx_buffer_size: DEF_RX_BUF_SIZE,
            debug: 0,
            max_devices: MAX_PCI_DEVICES,
        }
    }
}

impl PgpCardConfig {
    pub fn with_tx_buffers(mut self, count: usize, size: usize) -> Self {
        self.tx_buffer_count = count;
        self.tx_buffer_size = size;
        self
    }

    pub fn with_rx_buffers(mut self, count: usize, size: usize) -> Self {
        self.rx_buffer_count = count;
        self.rx_buffer_size = size;
        self
    }

    pub fn with_debug(mut self, debug: u32) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_max_devices(mut self, max_devices: usize) -> Self {
        self.max_devices = max_devices;
        self
    }

    /// 检查配置，在分配任何资源之前调用
    pub fn validate(&self) -> PgpResult<()> {
        if self.tx_buffer_count == 0 || self.rx_buffer_count == 0 {
            return Err(PgpError::InvalidConfig("buffer count must be non-zero"));
        }
        if self.max_devices == 0 {
            return Err(PgpError::InvalidConfig("max_devices must be non-zero"));
        }

        for size in [self.tx_buffer_size, self.rx_buffer_size] {
            if size == 0 || size % pgpcard_protocol::WORD_SIZE != 0 {
                return Err(PgpError::InvalidConfig(
                    "buffer size must be a non-zero multiple of 4",
                ));
            }
            // 描述符长度字段以字为单位
            if (size / pgpcard_protocol::WORD_SIZE) as u64 > u64::from(tx_desc::LENGTH.max_value()) {
                return Err(PgpError::InvalidConfig(
                    "buffer size exceeds the descriptor length field",
                ));
            }
        }

        if self.rx_buffer_size as u64 > u64::from(rx_max_frame::SIZE.max_value()) {
            return Err(PgpError::InvalidConfig(
                "rx buffer size exceeds the max-frame register",
            ));
        }

        Ok(())
    }
}
