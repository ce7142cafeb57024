//! 驱动错误

use deku::DekuError;
use derive_more::Display;
use libdriver::{errno, DriverError};
use pgpcard_protocol::ProtocolError;

/// 驱动错误类型
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum PgpError {
    /// 记录长度与布局不符
    #[display("record is {actual} bytes, layout needs {expected}")]
    RecordSize { expected: usize, actual: usize },

    /// 记录内容无法解析
    #[display("malformed record: {_0}")]
    Malformed(String),

    /// 帧超过缓冲区容量
    #[display("frame of {bytes} bytes exceeds the {capacity}-byte buffer")]
    Oversize { bytes: usize, capacity: usize },

    /// 未知命令
    #[display("unknown command {_0:#x}")]
    UnknownCommand(u32),

    /// 资源暂不可用（非阻塞模式）
    #[display("operation would block")]
    WouldBlock,

    /// 等待被取消，可由调用者重试
    #[display("wait interrupted, restart the call")]
    Restart,

    /// 设备忙
    #[display("device busy")]
    Busy,

    /// 调用者地址无法访问
    #[display("bad caller address {_0:#x}")]
    Fault(u64),

    /// 设备不存在或已分离
    #[display("no such device")]
    NoDevice,

    /// 注册表已满
    #[display("too many devices")]
    RegistryFull,

    /// 不支持的设备
    #[display("unsupported device {_0}")]
    NotSupported(String),

    /// 配置无效
    #[display("invalid configuration: {_0}")]
    InvalidConfig(&'static str),

    /// 框架错误
    #[display("driver error: {_0:?}")]
    Driver(DriverError),
}

impl PgpError {
    /// 对应的 errno
    pub fn errno(&self) -> i32 {
        match self {
            PgpError::RecordSize { .. } | PgpError::Malformed(_) => errno::EINVAL,
            PgpError::Oversize { .. } => errno::EMSGSIZE,
            PgpError::UnknownCommand(_) => errno::ENOTTY,
            PgpError::WouldBlock => errno::EAGAIN,
            PgpError::Restart => errno::ERESTARTSYS,
            PgpError::Busy => errno::EBUSY,
            PgpError::Fault(_) => errno::EFAULT,
            PgpError::NoDevice => errno::ENODEV,
            PgpError::RegistryFull => errno::ENOSPC,
            PgpError::NotSupported(_) => errno::EOPNOTSUPP,
            PgpError::InvalidConfig(_) => errno::EINVAL,
            PgpError::Driver(e) => e.errno(),
        }
    }
}

impl core::error::Error for PgpError {}

impl From<DriverError> for PgpError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::WouldBlock => PgpError::WouldBlock,
            DriverError::Interrupted => PgpError::Restart,
            DriverError::DeviceBusy => PgpError::Busy,
            e => PgpError::Driver(e),
        }
    }
}

impl From<ProtocolError> for PgpError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Truncated { expected, actual }
            | ProtocolError::SizeMismatch { expected, actual } => {
                PgpError::RecordSize { expected, actual }
            }
            ProtocolError::Malformed(msg) => PgpError::Malformed(msg),
        }
    }
}

impl From<DekuError> for PgpError {
    fn from(e: DekuError) -> Self {
        PgpError::Malformed(e.to_string())
    }
}

pub type PgpResult<T> = Result<T, PgpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_have_distinct_codes() {
        let codes = [
            PgpError::RecordSize {
                expected: 36,
                actual: 12,
            }
            .errno(),
            PgpError::Oversize {
                bytes: 8,
                capacity: 4,
            }
            .errno(),
            PgpError::UnknownCommand(0x99).errno(),
            PgpError::WouldBlock.errno(),
            PgpError::Restart.errno(),
            PgpError::Busy.errno(),
            PgpError::Fault(0).errno(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn framework_errors_map_onto_driver_errors() {
        assert_eq!(PgpError::from(DriverError::Interrupted), PgpError::Restart);
        assert_eq!(PgpError::from(DriverError::WouldBlock), PgpError::WouldBlock);
        assert_eq!(
            PgpError::from(DriverError::OutOfMemory),
            PgpError::Driver(DriverError::OutOfMemory)
        );
        assert_eq!(PgpError::Restart.errno(), errno::ERESTARTSYS);
    }

    #[test]
    fn protocol_size_errors_become_record_size() {
        let e = PgpError::from(ProtocolError::SizeMismatch {
            expected: 40,
            actual: 36,
        });
        assert_eq!(
            e,
            PgpError::RecordSize {
                expected: 40,
                actual: 36
            }
        );
        assert_eq!(e.to_string(), "record is 36 bytes, layout needs 40");
    }
}
