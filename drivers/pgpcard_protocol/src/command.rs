//! 控制命令编码
//!
//! 写入记录的 `cmd` 字段不是 [`Command::NormalWrite`] 时，记录被当作控制命令处理，
//! `data` 字段就是命令的立即参数。

/// 控制命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// 普通写
    NormalWrite,
    /// 读取状态快照，参数为目标地址
    ReadStatus,
    /// 计数器复位脉冲
    CountReset,
    /// 发送 PGP 操作码
    PgpOpCode,
    SetLoop,
    ClrLoop,
    SetRxReset,
    ClrRxReset,
    SetTxReset,
    ClrTxReset,
    EvrEnable,
    EvrDisable,
    EvrSetReset,
    EvrClrReset,
    EvrSetPllRst,
    EvrClrPllRst,
    /// EVR 虚拟通道屏蔽
    EvrMask,
    /// EVR 运行触发操作码 [0..8)
    EvrRunCode(u8),
    /// EVR 接受触发操作码 [0..8)
    EvrAcceptCode(u8),
    EvrRunDelay(u8),
    EvrAcceptDelay(u8),
    /// 空操作
    Nop,
    /// 设置调试级别
    SetDebug,
    /// 输出内部诊断信息
    DumpDebug,
}

const EVR_RUN_CODE_BASE: u32 = 0x30;
const EVR_ACCEPT_CODE_BASE: u32 = 0x38;
const EVR_RUN_DELAY_BASE: u32 = 0x40;
const EVR_ACCEPT_DELAY_BASE: u32 = 0x48;
const EVR_INDEX_COUNT: u32 = 8;

impl Command {
    /// 解码命令码，未知命令返回 `None`
    pub fn from_code(code: u32) -> Option<Self> {
        let indexed = |base: u32| {
            code.checked_sub(base)
                .filter(|index| *index < EVR_INDEX_COUNT)
                .map(|index| index as u8)
        };

        let command = match code {
            0x00 => Command::NormalWrite,
            0x01 => Command::ReadStatus,
            0x02 => Command::CountReset,
            0x03 => Command::PgpOpCode,
            0x10 => Command::SetLoop,
            0x11 => Command::ClrLoop,
            0x12 => Command::SetRxReset,
            0x13 => Command::ClrRxReset,
            0x14 => Command::SetTxReset,
            0x15 => Command::ClrTxReset,
            // 旧版单寄存器命令
            0x20 => Command::EvrRunCode(0),
            0x21 => Command::EvrAcceptCode(0),
            0x22 => Command::EvrEnable,
            0x23 => Command::EvrDisable,
            0x24 => Command::EvrSetReset,
            0x25 => Command::EvrClrReset,
            0x26 => Command::EvrSetPllRst,
            0x27 => Command::EvrClrPllRst,
            0x28 => Command::EvrMask,
            0xFD => Command::Nop,
            0xFE => Command::SetDebug,
            0xFF => Command::DumpDebug,
            _ => {
                if let Some(i) = indexed(EVR_RUN_CODE_BASE) {
                    Command::EvrRunCode(i)
                } else if let Some(i) = indexed(EVR_ACCEPT_CODE_BASE) {
                    Command::EvrAcceptCode(i)
                } else if let Some(i) = indexed(EVR_RUN_DELAY_BASE) {
                    Command::EvrRunDelay(i)
                } else if let Some(i) = indexed(EVR_ACCEPT_DELAY_BASE) {
                    Command::EvrAcceptDelay(i)
                } else {
                    return None;
                }
            }
        };

        Some(command)
    }

    /// 命令码
    pub fn code(self) -> u32 {
        match self {
            Command::NormalWrite => 0x00,
            Command::ReadStatus => 0x01,
            Command::CountReset => 0x02,
            Command::PgpOpCode => 0x03,
            Command::SetLoop => 0x10,
            Command::ClrLoop => 0x11,
            Command::SetRxReset => 0x12,
            Command::ClrRxReset => 0x13,
            Command::SetTxReset => 0x14,
            Command::ClrTxReset => 0x15,
            Command::EvrEnable => 0x22,
            Command::EvrDisable => 0x23,
            Command::EvrSetReset => 0x24,
            Command::EvrClrReset => 0x25,
            Command::EvrSetPllRst => 0x26,
            Command::EvrClrPllRst => 0x27,
            Command::EvrMask => 0x28,
            Command::EvrRunCode(i) => EVR_RUN_CODE_BASE + u32::from(i),
            Command::EvrAcceptCode(i) => EVR_ACCEPT_CODE_BASE + u32::from(i),
            Command::EvrRunDelay(i) => EVR_RUN_DELAY_BASE + u32::from(i),
            Command::EvrAcceptDelay(i) => EVR_ACCEPT_DELAY_BASE + u32::from(i),
            Command::Nop => 0xFD,
            Command::SetDebug => 0xFE,
            Command::DumpDebug => 0xFF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_code_round_trips() {
        for code in 0..=0xFFu32 {
            if let Some(command) = Command::from_code(code) {
                match code {
                    0x20 | 0x21 => assert_ne!(command.code(), code),
                    _ => assert_eq!(command.code(), code, "{command:?}"),
                }
            }
        }
    }

    #[test]
    fn indexed_evr_commands() {
        assert_eq!(Command::from_code(0x30), Some(Command::EvrRunCode(0)));
        assert_eq!(Command::from_code(0x37), Some(Command::EvrRunCode(7)));
        assert_eq!(Command::from_code(0x3A), Some(Command::EvrAcceptCode(2)));
        assert_eq!(Command::from_code(0x45), Some(Command::EvrRunDelay(5)));
        assert_eq!(Command::from_code(0x4F), Some(Command::EvrAcceptDelay(7)));
        assert_eq!(Command::from_code(0x50), None);
    }

    #[test]
    fn legacy_codes_map_to_index_zero() {
        assert_eq!(Command::from_code(0x20), Some(Command::EvrRunCode(0)));
        assert_eq!(Command::from_code(0x21), Some(Command::EvrAcceptCode(0)));
    }

    #[test]
    fn unknown_codes() {
        for code in [0x04, 0x16, 0x29, 0x2F, 0x80, 0xFC, 0x100, u32::MAX] {
            assert_eq!(Command::from_code(code), None, "{code:#x}");
        }
    }
}
