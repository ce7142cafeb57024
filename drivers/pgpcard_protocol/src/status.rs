//! 状态快照记录

use deku::prelude::*;

use crate::record::ProtocolError;
use crate::{LANE_COUNT, VC_COUNT};

/// 固件构建标识，64 个字按小端拼成 ASCII 字符串
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(ctx = "endian: deku::ctx::Endian", endian = "endian")]
pub struct BuildStamp(pub [u32; 64]);

impl Default for BuildStamp {
    fn default() -> Self {
        Self([0; 64])
    }
}

impl BuildStamp {
    /// 解析为字符串，遇到第一个 NUL 截止
    pub fn as_string(&self) -> String {
        let bytes: Vec<u8> = self
            .0
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .take_while(|&b| b != 0)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// 状态快照
///
/// 由一次寄存器遍历解码得到；各计数器可能在读取不同字段之间继续变化。
#[derive(Debug, Clone, Default, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct PgpCardStatus {
    // 通用状态
    pub version: u32,
    /// [高 32 位, 低 32 位]
    pub serial_number: [u32; 2],
    /// 写入自检值后读回的结果
    pub scratch_pad: u32,
    pub build_stamp: BuildStamp,
    pub count_reset: u32,
    pub card_reset: u32,

    // PCI 状态与控制
    pub pci_command: u32,
    pub pci_status: u32,
    pub pci_d_command: u32,
    pub pci_d_status: u32,
    pub pci_l_command: u32,
    pub pci_l_status: u32,
    pub pci_link_state: u32,
    pub pci_function: u32,
    pub pci_device: u32,
    pub pci_bus: u32,
    pub pci_base_hdwr: u32,
    pub pci_base_len: u32,

    // PGP 状态
    pub pgp_rate: u32,
    pub pgp_loop_back: [u32; LANE_COUNT],
    pub pgp_tx_reset: [u32; LANE_COUNT],
    pub pgp_rx_reset: [u32; LANE_COUNT],
    pub pgp_tx_pll_rst: [u32; 2],
    pub pgp_rx_pll_rst: [u32; 2],
    pub pgp_tx_pll_rdy: [u32; 2],
    pub pgp_rx_pll_rdy: [u32; 2],
    pub pgp_loc_link_ready: [u32; LANE_COUNT],
    pub pgp_rem_link_ready: [u32; LANE_COUNT],
    pub pgp_rx_count: [[u32; VC_COUNT]; LANE_COUNT],
    pub pgp_cell_err_cnt: [u32; LANE_COUNT],
    pub pgp_link_down_cnt: [u32; LANE_COUNT],
    pub pgp_link_err_cnt: [u32; LANE_COUNT],
    pub pgp_fifo_err_cnt: [u32; LANE_COUNT],

    // EVR 状态与控制
    pub evr_run_code: [u32; 8],
    pub evr_accept_code: [u32; 8],
    pub evr_run_delay: [u32; 8],
    pub evr_accept_delay: [u32; 8],
    pub evr_en_hdr_check: [[u32; VC_COUNT]; LANE_COUNT],
    pub evr_enable: u32,
    pub evr_ready: u32,
    pub evr_reset: u32,
    pub evr_pll_rst: u32,
    pub evr_err_cnt: u32,

    // RX 描述符状态
    pub rx_free_full: [u32; LANE_COUNT],
    pub rx_free_valid: [u32; LANE_COUNT],
    pub rx_free_fifo_count: [u32; LANE_COUNT],
    pub rx_read_ready: u32,
    pub rx_ret_fifo_count: u32,
    pub rx_count: u32,
    /// 驱动 RX 队列写指针
    pub rx_write: u32,
    /// 驱动 RX 队列读指针
    pub rx_read: u32,

    // TX 描述符状态
    pub tx_dma_a_full: [u32; LANE_COUNT],
    pub tx_read_ready: u32,
    pub tx_ret_fifo_count: u32,
    pub tx_count: u32,
    pub tx_write: u32,
    pub tx_read: u32,
    pub tx_fifo_cnt: [u32; LANE_COUNT],
}

impl PgpCardStatus {
    /// 记录长度（字节）
    pub const RECORD_SIZE: usize = 314 * 4;

    /// 编码为记录
    pub fn to_record(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.to_bytes()?)
    }

    /// 从记录解码
    pub fn from_record(record: &[u8]) -> Result<Self, ProtocolError> {
        if record.len() < Self::RECORD_SIZE {
            return Err(ProtocolError::Truncated {
                expected: Self::RECORD_SIZE,
                actual: record.len(),
            });
        }
        let (_, status) = Self::from_bytes((record, 0))?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_has_fixed_size() {
        let record = PgpCardStatus::default().to_record().unwrap();
        assert_eq!(record.len(), PgpCardStatus::RECORD_SIZE);
    }

    #[test]
    fn field_order_is_stable() {
        let status = PgpCardStatus {
            version: 0x0300_0001,
            serial_number: [0xAAAA_0000, 0x0000_BBBB],
            scratch_pad: 0x5544_1122,
            tx_fifo_cnt: [1, 2, 3, 4, 5, 6, 7, 8],
            ..Default::default()
        };
        let record = status.to_record().unwrap();
        let word = |i: usize| u32::from_le_bytes(record[i * 4..i * 4 + 4].try_into().unwrap());

        assert_eq!(word(0), 0x0300_0001);
        assert_eq!(word(1), 0xAAAA_0000);
        assert_eq!(word(2), 0x0000_BBBB);
        assert_eq!(word(3), 0x5544_1122);
        assert_eq!(word(306), 1);
        assert_eq!(word(313), 8);

        assert_eq!(PgpCardStatus::from_record(&record).unwrap(), status);
    }

    #[test]
    fn build_stamp_string() {
        let mut stamp = BuildStamp::default();
        for (i, chunk) in b"PgpCardG3: built 2013".chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            stamp.0[i] = u32::from_le_bytes(word);
        }
        assert_eq!(stamp.as_string(), "PgpCardG3: built 2013");
    }

    #[test]
    fn short_record_is_rejected() {
        assert!(matches!(
            PgpCardStatus::from_record(&[0; 16]),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
