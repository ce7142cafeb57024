//! PgpCardG3 寄存器
//!
//! 寄存器窗口布局，以及每个寄存器的位域表（字段名、起始位、宽度）。
//! 所有读写都直接到达硬件，这里不缓存任何值。

use core::ops::Range;

use bit_field::BitField;
use libdriver::define_regs;
use pgpcard_protocol::FrameFlags;

// 寄存器偏移常量
pub mod offsets {
    pub const VERSION: usize = 0x000;
    pub const SER_NUM_LOWER: usize = 0x004;
    pub const SER_NUM_UPPER: usize = 0x008;
    pub const SCRATCH: usize = 0x00C;
    pub const CARD_RST_STAT: usize = 0x010;
    pub const IRQ: usize = 0x014;
    pub const PGP_RATE: usize = 0x018;
    pub const REBOOT: usize = 0x01C;
    pub const PGP_OP_CODE: usize = 0x020;
    pub const PCI_STAT: usize = 0x02C; // [4]
    pub const EVR_CARD_STAT: usize = 0x040; // [3]
    pub const PGP_CARD_STAT: usize = 0x080; // [2]
    pub const RUN_CODE: usize = 0x180; // [8]
    pub const ACCEPT_CODE: usize = 0x1A0; // [8]
    pub const RUN_DELAY: usize = 0x1C0; // [8]
    pub const ACCEPT_DELAY: usize = 0x1E0; // [8]
    pub const PGP_LANE_STAT: usize = 0x200; // [8]
    pub const BUILD_STAMP: usize = 0x300; // [64]

    pub const RX_FREE: usize = 0x400; // [8]
    pub const RX_FREE_STAT: usize = 0x480; // [8]
    pub const RX_MAX_FRAME: usize = 0x500;
    pub const RX_COUNT: usize = 0x504;
    pub const RX_STATUS: usize = 0x508;
    pub const RX_READ: usize = 0x50C; // [2]

    pub const TX_WR_A: usize = 0x800; // [8]
    pub const TX_WR_B: usize = 0x880; // [8]
    pub const TX_STAT: usize = 0x900; // [2]
    pub const TX_COUNT: usize = 0x908;
    pub const TX_READ: usize = 0x90C;
    pub const TX_FIFO_CNT: usize = 0x910; // [8]

    /// 寄存器窗口大小
    pub const REGION_SIZE: usize = 0x1000;
}

define_regs! {
    pub struct PgpRegs {
        /// Firmware Version - 固件版本
        version where offsets::VERSION,
        /// Serial Number (low word) - 序列号低位
        ser_num_lower where offsets::SER_NUM_LOWER,
        /// Serial Number (high word) - 序列号高位
        ser_num_upper where offsets::SER_NUM_UPPER,
        /// Scratch Pad - 暂存寄存器
        scratch where offsets::SCRATCH,
        /// Card Reset / Count Reset - 板卡与计数器复位
        card_rst_stat where offsets::CARD_RST_STAT,
        /// Interrupt Control/Status - 中断控制与状态
        irq where offsets::IRQ,
        /// PGP Link Rate - 链路速率
        pgp_rate where offsets::PGP_RATE,
        reboot where offsets::REBOOT,
        /// PGP OP-Code - 带外操作码
        pgp_op_code where offsets::PGP_OP_CODE,
        /// PCIe Status - PCIe 状态
        pci_stat[4] where offsets::PCI_STAT,
        /// EVR Status & Control - 定时系统状态与控制
        evr_card_stat[3] where offsets::EVR_CARD_STAT,
        /// PGP Card Status & Control - 通道复位、回环、PLL
        pgp_card_stat[2] where offsets::PGP_CARD_STAT,
        run_code[8] where offsets::RUN_CODE,
        accept_code[8] where offsets::ACCEPT_CODE,
        run_delay[8] where offsets::RUN_DELAY,
        accept_delay[8] where offsets::ACCEPT_DELAY,
        /// Per-Lane Status - 通道计数器
        pgp_lane_stat[8] where offsets::PGP_LANE_STAT,
        build_stamp[64] where offsets::BUILD_STAMP,

        /// RX Free List - RX 空闲缓冲区 FIFO（按通道）
        rx_free[8] where offsets::RX_FREE,
        rx_free_stat[8] where offsets::RX_FREE_STAT,
        /// RX Max Frame - 最大帧长与使能
        rx_max_frame where offsets::RX_MAX_FRAME,
        rx_count where offsets::RX_COUNT,
        /// RX Return FIFO Status - RX 完成 FIFO 状态
        rx_status where offsets::RX_STATUS,
        /// RX Return Descriptor (A, B) - RX 完成描述符
        rx_read[2] where offsets::RX_READ,

        /// TX Descriptor A - 通道/虚拟通道/长度
        tx_wr_a[8] where offsets::TX_WR_A,
        /// TX Descriptor B - 缓冲区总线地址
        tx_wr_b[8] where offsets::TX_WR_B,
        /// TX Status - TX 几乎满标志与完成 FIFO 状态
        tx_stat[2] where offsets::TX_STAT,
        tx_count where offsets::TX_COUNT,
        /// TX Return - TX 完成（地址 | 有效位）
        tx_read where offsets::TX_READ,
        tx_fifo_cnt[8] where offsets::TX_FIFO_CNT,
    }
}

/// 寄存器位域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    /// 起始位
    pub offset: u8,
    /// 宽度（位）
    pub width: u8,
}

impl Field {
    pub const fn new(name: &'static str, offset: u8, width: u8) -> Self {
        Self {
            name,
            offset,
            width,
        }
    }

    /// 单个位
    pub const fn bit(name: &'static str, offset: u8) -> Self {
        Self::new(name, offset, 1)
    }

    /// 同一寄存器中第 `index` 个同类字段，相邻字段紧挨排列
    pub const fn shifted(self, index: usize) -> Self {
        Self::new(self.name, self.offset + self.width * index as u8, self.width)
    }

    #[inline]
    fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.width) as usize
    }

    /// 字段能表示的最大值
    #[inline]
    pub fn max_value(&self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.width) - 1
        }
    }

    /// 字段在寄存器中的掩码
    #[inline]
    pub fn mask(&self) -> u32 {
        self.max_value() << self.offset
    }

    /// 解码
    #[inline]
    pub fn get(&self, word: u32) -> u32 {
        word.get_bits(self.range())
    }

    /// 写入字段，超出宽度的高位被丢弃
    #[inline]
    pub fn set(&self, word: &mut u32, value: u32) {
        word.set_bits(self.range(), value & self.max_value());
    }

    /// 只含该字段的寄存器值
    #[inline]
    pub fn encode(&self, value: u32) -> u32 {
        let mut word = 0;
        self.set(&mut word, value);
        word
    }

    #[inline]
    pub fn is_set(&self, word: u32) -> bool {
        self.get(word) != 0
    }
}

/// cardRstStat
pub mod card_rst_stat {
    use super::Field;

    pub const COUNT_RESET: Field = Field::bit("CountReset", 0);
    pub const CARD_RESET: Field = Field::bit("CardReset", 1);

    pub const FIELDS: &[Field] = &[COUNT_RESET, CARD_RESET];
}

/// irq
pub mod irq {
    use super::Field;

    /// 中断使能
    pub const ENABLE: Field = Field::bit("Enable", 0);
    /// 本卡有待处理的中断
    pub const PENDING: Field = Field::bit("Pending", 1);

    pub const FIELDS: &[Field] = &[ENABLE, PENDING];
}

/// pciStat[0..3]：高 16 位命令，低 16 位状态；pciStat[3]：链路信息
pub mod pci_stat {
    use super::Field;

    pub const COMMAND: Field = Field::new("Command", 16, 16);
    pub const STATUS: Field = Field::new("Status", 0, 16);

    pub const LINK_STATE: Field = Field::new("LinkState", 24, 3);
    pub const FUNCTION: Field = Field::new("Function", 16, 2);
    pub const DEVICE: Field = Field::new("Device", 8, 5);
    pub const BUS: Field = Field::new("Bus", 0, 8);

    pub const FIELDS: &[Field] = &[COMMAND, STATUS];
    pub const LINK_FIELDS: &[Field] = &[LINK_STATE, FUNCTION, DEVICE, BUS];
}

/// evrCardStat[0..3]
pub mod evr_card_stat {
    use super::Field;

    // [0]
    pub const READY: Field = Field::bit("EvrReady", 4);
    pub const ERR_CNT: Field = Field::new("EvrErrCnt", 0, 4);

    // [1]
    pub const PLL_RST: Field = Field::bit("EvrPllRst", 2);
    pub const RESET: Field = Field::bit("EvrReset", 1);
    pub const ENABLE: Field = Field::bit("EvrEnable", 0);

    /// [2]：第 `4 * lane + vc` 位
    pub const EN_HDR_CHECK: Field = Field::bit("EvrEnHdrCheck", 0);

    pub const STATUS_FIELDS: &[Field] = &[READY, ERR_CNT];
    pub const CONTROL_FIELDS: &[Field] = &[PLL_RST, RESET, ENABLE];
}

/// pgpCardStat[0..2]，通道字段按 `shifted(lane)` 取第 lane 个
pub mod pgp_card_stat {
    use super::Field;

    // [0]，PLL 字段只有 2 组
    pub const TX_PLL_RDY: Field = Field::bit("PgpTxPllRdy", 30);
    pub const RX_PLL_RDY: Field = Field::bit("PgpRxPllRdy", 28);
    pub const TX_PLL_RST: Field = Field::bit("PgpTxPllRst", 26);
    pub const RX_PLL_RST: Field = Field::bit("PgpRxPllRst", 24);
    pub const TX_RESET: Field = Field::bit("PgpTxReset", 16);
    pub const RX_RESET: Field = Field::bit("PgpRxReset", 8);
    pub const LOOP_BACK: Field = Field::bit("PgpLoopBack", 0);

    // [1]
    pub const REM_LINK_READY: Field = Field::bit("PgpRemLinkReady", 8);
    pub const LOC_LINK_READY: Field = Field::bit("PgpLocLinkReady", 0);

    /// PLL 组数
    pub const PLL_COUNT: usize = 2;
}

/// pgpLaneStat[lane]
pub mod lane_stat {
    use super::Field;

    pub const LINK_ERR_CNT: Field = Field::new("PgpLinkErrCnt", 28, 4);
    pub const LINK_DOWN_CNT: Field = Field::new("PgpLinkDownCnt", 24, 4);
    pub const CELL_ERR_CNT: Field = Field::new("PgpCellErrCnt", 20, 4);
    pub const FIFO_ERR_CNT: Field = Field::new("PgpFifoErrCnt", 16, 4);
    /// 按 `shifted(vc)` 取第 vc 个
    pub const RX_COUNT: Field = Field::new("PgpRxCount", 0, 4);

    pub const FIELDS: &[Field] = &[
        LINK_ERR_CNT,
        LINK_DOWN_CNT,
        CELL_ERR_CNT,
        FIFO_ERR_CNT,
        RX_COUNT.shifted(3),
        RX_COUNT.shifted(2),
        RX_COUNT.shifted(1),
        RX_COUNT,
    ];
}

/// runCode / acceptCode
pub mod evr_code {
    use super::Field;

    pub const CODE: Field = Field::new("OpCode", 0, 8);
}

/// rxFreeStat[lane]
pub mod rx_free_stat {
    use super::Field;

    pub const FULL: Field = Field::bit("RxFreeFull", 31);
    pub const VALID: Field = Field::bit("RxFreeValid", 30);
    pub const COUNT: Field = Field::new("RxFreeFifoCount", 0, 10);

    pub const FIELDS: &[Field] = &[FULL, VALID, COUNT];
}

/// rxStatus 与 txStat[1]：完成 FIFO 状态
pub mod fifo_status {
    use super::Field;

    pub const READY: Field = Field::bit("ReadReady", 31);
    pub const COUNT: Field = Field::new("RetFifoCount", 0, 10);

    pub const FIELDS: &[Field] = &[READY, COUNT];
}

/// txStat[0]：按 `shifted(lane)` 取第 lane 个
pub mod tx_stat {
    use super::Field;

    pub const DMA_A_FULL: Field = Field::bit("TxDmaAFull", 0);
}

/// rxMaxFrame
pub mod rx_max_frame {
    use super::Field;

    pub const SIZE: Field = Field::new("MaxFrame", 0, 31);
    pub const ENABLE: Field = Field::bit("Enable", 31);

    pub const FIELDS: &[Field] = &[SIZE, ENABLE];
}

/// txWrA
pub mod tx_desc {
    use super::Field;

    pub const LANE: Field = Field::new("Lane", 27, 5);
    pub const VC: Field = Field::new("Vc", 24, 3);
    /// 字数
    pub const LENGTH: Field = Field::new("Length", 0, 24);

    pub const FIELDS: &[Field] = &[LANE, VC, LENGTH];
}

/// txRead：完成的 TX 缓冲区
pub mod tx_ret {
    use super::Field;

    pub const ADDR: Field = Field::new("Addr", 2, 30);
    pub const VALID: Field = Field::bit("Valid", 0);

    pub const FIELDS: &[Field] = &[ADDR, VALID];
}

/// rxRead[0]
pub mod rx_desc_a {
    use super::Field;

    pub const FIFO_ERR: Field = Field::bit("FifoErr", 31);
    pub const EOFE: Field = Field::bit("Eofe", 30);
    pub const LANE: Field = Field::new("Lane", 26, 3);
    pub const VC: Field = Field::new("Vc", 24, 2);
    /// 字数
    pub const LENGTH: Field = Field::new("Length", 0, 24);

    pub const FIELDS: &[Field] = &[FIFO_ERR, EOFE, LANE, VC, LENGTH];
}

/// rxRead[1]
pub mod rx_desc_b {
    use super::Field;

    pub const ADDR: Field = Field::new("Addr", 2, 30);
    pub const LENGTH_ERR: Field = Field::bit("LengthErr", 1);
    pub const VALID: Field = Field::bit("Valid", 0);

    pub const FIELDS: &[Field] = &[ADDR, LENGTH_ERR, VALID];
}

/// TX 描述符（txWrA）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDescriptor {
    pub lane: u32,
    pub vc: u32,
    /// 字数
    pub length: u32,
}

impl TxDescriptor {
    pub fn encode(&self) -> u32 {
        let mut word = 0;
        tx_desc::LANE.set(&mut word, self.lane);
        tx_desc::VC.set(&mut word, self.vc);
        tx_desc::LENGTH.set(&mut word, self.length);
        word
    }

    pub fn decode(word: u32) -> Self {
        Self {
            lane: tx_desc::LANE.get(word),
            vc: tx_desc::VC.get(word),
            length: tx_desc::LENGTH.get(word),
        }
    }
}

/// 解码 txRead，无效时返回 `None`
pub fn decode_tx_return(word: u32) -> Option<u32> {
    tx_ret::VALID
        .is_set(word)
        .then_some(word & tx_ret::ADDR.mask())
}

/// 编码 txRead
pub fn encode_tx_return(addr: u32) -> u32 {
    (addr & tx_ret::ADDR.mask()) | tx_ret::VALID.encode(1)
}

/// RX 完成描述符（rxRead[0], rxRead[1]）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxDescriptor {
    pub lane: u32,
    pub vc: u32,
    /// 字数
    pub length: u32,
    pub flags: FrameFlags,
    /// 缓冲区总线地址
    pub addr: u32,
}

impl RxDescriptor {
    /// 解码，描述符 B 的有效位为 0 时返回 `None`
    pub fn decode(desc_a: u32, desc_b: u32) -> Option<Self> {
        if !rx_desc_b::VALID.is_set(desc_b) {
            return None;
        }

        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::FIFO_ERR, rx_desc_a::FIFO_ERR.is_set(desc_a));
        flags.set(FrameFlags::EOFE, rx_desc_a::EOFE.is_set(desc_a));
        flags.set(FrameFlags::LENGTH_ERR, rx_desc_b::LENGTH_ERR.is_set(desc_b));

        Some(Self {
            lane: rx_desc_a::LANE.get(desc_a),
            vc: rx_desc_a::VC.get(desc_a),
            length: rx_desc_a::LENGTH.get(desc_a),
            flags,
            addr: desc_b & rx_desc_b::ADDR.mask(),
        })
    }

    /// 编码为 (A, B)，B 带有效位
    pub fn encode(&self) -> (u32, u32) {
        let mut desc_a = 0;
        rx_desc_a::FIFO_ERR.set(&mut desc_a, self.flags.contains(FrameFlags::FIFO_ERR) as u32);
        rx_desc_a::EOFE.set(&mut desc_a, self.flags.contains(FrameFlags::EOFE) as u32);
        rx_desc_a::LANE.set(&mut desc_a, self.lane);
        rx_desc_a::VC.set(&mut desc_a, self.vc);
        rx_desc_a::LENGTH.set(&mut desc_a, self.length);

        let mut desc_b = self.addr & rx_desc_b::ADDR.mask();
        rx_desc_b::LENGTH_ERR.set(
            &mut desc_b,
            self.flags.contains(FrameFlags::LENGTH_ERR) as u32,
        );
        rx_desc_b::VALID.set(&mut desc_b, 1);

        (desc_a, desc_b)
    }
}
