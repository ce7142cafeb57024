//! 模拟板卡
//!
//! 在主机内存上实现 PgpCardG3 的寄存器窗口：每通道的 RX 空闲 FIFO、TX/RX 完成 FIFO、
//! 中断状态位，以及按通道回环的 DMA 搬运。写入 txWrB 时立即完成发送，
//! 回环打开时把数据搬进该通道（或任一通道）空闲 FIFO 里的 RX 缓冲区。

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use libdriver::{HostDmaAllocator, IrqLine, PhysAddr, RegisterBus};
use log::warn;
use pci_types::PciAddress;
use pgpcard_protocol::{FrameFlags, LANE_COUNT, WORD_SIZE};

use crate::device::DeviceResources;
use crate::error::{PgpError, PgpResult};
use crate::memory::CallerMemory;
use crate::regs::{
    encode_tx_return, fifo_status, irq, offsets, pgp_card_stat, rx_free_stat, rx_max_frame,
    RxDescriptor, TxDescriptor,
};
use crate::{PCI_DEVICE_ID_PGPCARD, PCI_VENDOR_ID_SLAC};

/// 模拟 BAR0 的物理地址
pub const SIM_BAR_BASE: u64 = 0xF7E0_0000;
/// 模拟固件版本
pub const SIM_VERSION: u32 = 0xCE30_0003;

const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// `offset` 落在 `base` 开始的 `count` 个寄存器中时返回下标
fn index_in(offset: usize, base: usize, count: usize) -> Option<usize> {
    (offset >= base && offset < base + count * 4 && offset % 4 == 0).then(|| (offset - base) / 4)
}

fn fifo_word(len: usize) -> u32 {
    let mut word = 0;
    fifo_status::READY.set(&mut word, u32::from(len > 0));
    fifo_status::COUNT.set(&mut word, len as u32);
    word
}

struct SimState {
    regs: BTreeMap<usize, u32>,
    free: [VecDeque<u32>; LANE_COUNT],
    tx_ret: VecDeque<u32>,
    rx_ret: VecDeque<(u32, u32)>,
    /// 暂扣的 TX 完成
    held_tx: Vec<u32>,
    hold_tx: bool,
    /// 已投递中断、驱动尚未排空
    handling: bool,
    writes: Vec<(usize, u32)>,
}

impl SimState {
    fn reg(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn has_completions(&self) -> bool {
        !self.tx_ret.is_empty() || !self.rx_ret.is_empty()
    }

    fn take_free(&mut self, lane: usize) -> Option<u32> {
        self.free[lane]
            .pop_front()
            .or_else(|| self.free.iter_mut().find_map(VecDeque::pop_front))
    }
}

/// 模拟板卡
pub struct SimCard {
    address: PciAddress,
    state: Mutex<SimState>,
    idle: Condvar,
    dma: Arc<HostDmaAllocator>,
    irq: Arc<IrqLine>,
}

impl SimCard {
    pub fn new() -> Arc<Self> {
        Self::at(PciAddress::new(0, 1, 0, 0))
    }

    /// 指定 PCI 地址的模拟板卡
    pub fn at(address: PciAddress) -> Arc<Self> {
        let mut regs = BTreeMap::new();
        regs.insert(offsets::VERSION, SIM_VERSION);
        // 上电时板卡处于复位
        regs.insert(offsets::CARD_RST_STAT, 0x2);

        Arc::new(Self {
            address,
            state: Mutex::new(SimState {
                regs,
                free: Default::default(),
                tx_ret: VecDeque::new(),
                rx_ret: VecDeque::new(),
                held_tx: Vec::new(),
                hold_tx: false,
                handling: false,
                writes: Vec::new(),
            }),
            idle: Condvar::new(),
            dma: Arc::new(HostDmaAllocator::new()),
            irq: Arc::new(IrqLine::new(16 + u32::from(address.device()))),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// probe 用的设备资源
    pub fn resources(self: &Arc<Self>) -> DeviceResources {
        DeviceResources {
            address: self.address,
            vendor_id: PCI_VENDOR_ID_SLAC,
            device_id: PCI_DEVICE_ID_PGPCARD,
            bus: self.clone(),
            base_hdwr: SIM_BAR_BASE,
            base_len: offsets::REGION_SIZE,
            irq: self.irq.clone(),
            dma: self.dma.clone(),
        }
    }

    pub fn dma(&self) -> &Arc<HostDmaAllocator> {
        &self.dma
    }

    /// 不产生副作用地读取寄存器
    pub fn peek(&self, offset: usize) -> u32 {
        self.lock().reg(offset)
    }

    /// 不产生副作用地设置寄存器，不记入写日志
    pub fn poke(&self, offset: usize, value: u32) {
        self.lock().regs.insert(offset, value);
    }

    /// 驱动写过的全部寄存器（按顺序）
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    /// 通道空闲 FIFO 的内容
    pub fn free_fifo(&self, lane: usize) -> Vec<u32> {
        self.lock().free[lane].iter().copied().collect()
    }

    /// 从通道空闲 FIFO 取走一个 RX 缓冲区，模拟硬件开始接收
    pub fn take_free_buffer(&self, lane: usize) -> Option<u32> {
        self.lock().free[lane].pop_front()
    }

    /// 暂扣 TX 完成，关闭时一次性放出
    pub fn hold_tx_completions(&self, hold: bool) {
        let mut state = self.lock();
        state.hold_tx = hold;
        if !hold {
            let held = core::mem::take(&mut state.held_tx);
            state.tx_ret.extend(held);
            self.interrupt(&mut state);
        }
    }

    /// 注入一个 RX 完成描述符
    pub fn inject_rx(&self, desc: RxDescriptor) {
        let mut state = self.lock();
        state.rx_ret.push_back(desc.encode());
        self.interrupt(&mut state);
    }

    /// 注入一个原始 TX 完成字
    pub fn inject_tx_return(&self, word: u32) {
        let mut state = self.lock();
        state.tx_ret.push_back(word);
        self.interrupt(&mut state);
    }

    /// 等待驱动排空全部完成 FIFO，超时返回 false
    pub fn wait_idle(&self) -> bool {
        let state = self.lock();
        let (state, _) = self
            .idle
            .wait_timeout_while(state, IDLE_TIMEOUT, |s| s.has_completions() || s.handling)
            .unwrap_or_else(PoisonError::into_inner);
        !state.has_completions() && !state.handling
    }

    /// 有完成且中断已使能时投递中断
    fn interrupt(&self, state: &mut SimState) {
        if !state.has_completions() {
            return;
        }
        if irq::ENABLE.is_set(state.reg(offsets::IRQ)) {
            state.handling = true;
            self.irq.raise();
        }
    }

    fn transmit(&self, state: &mut SimState, lane: usize, addr: u32) {
        let desc = TxDescriptor::decode(state.reg(offsets::TX_WR_A + lane * 4));
        let bytes = desc.length as usize * WORD_SIZE;

        let Some(payload) = self
            .dma
            .with_bus_memory(PhysAddr::new(u64::from(addr)), bytes, |src| src.to_vec())
        else {
            warn!("sim: TX from unmapped address {:#010x}", addr);
            return;
        };

        let ret = encode_tx_return(addr);
        if state.hold_tx {
            state.held_tx.push(ret);
        } else {
            state.tx_ret.push_back(ret);
        }

        let looped = pgp_card_stat::LOOP_BACK
            .shifted(lane)
            .is_set(state.reg(offsets::PGP_CARD_STAT));
        if looped {
            self.deliver(state, lane, desc.vc, &payload);
        }

        self.interrupt(state);
    }

    fn deliver(&self, state: &mut SimState, lane: usize, vc: u32, payload: &[u8]) {
        let Some(addr) = state.take_free(lane) else {
            warn!("sim: no free RX buffer for lane {}, frame dropped", lane);
            return;
        };

        let max_frame = rx_max_frame::SIZE.get(state.reg(offsets::RX_MAX_FRAME)) as usize;
        let mut flags = FrameFlags::empty();
        let len = if payload.len() > max_frame {
            flags |= FrameFlags::LENGTH_ERR;
            max_frame - max_frame % WORD_SIZE
        } else {
            payload.len()
        };

        let copied = self
            .dma
            .with_bus_memory(PhysAddr::new(u64::from(addr)), len, |dst| {
                dst.copy_from_slice(&payload[..len])
            });
        if copied.is_none() {
            warn!("sim: RX into unmapped address {:#010x}", addr);
            return;
        }

        let desc = RxDescriptor {
            lane: lane as u32,
            vc,
            length: (len / WORD_SIZE) as u32,
            flags,
            addr,
        };
        state.rx_ret.push_back(desc.encode());
    }
}

impl RegisterBus for SimCard {
    fn read_u32(&self, offset: usize) -> u32 {
        let mut state = self.lock();

        if let Some(lane) = index_in(offset, offsets::RX_FREE_STAT, LANE_COUNT) {
            // 首字直通：队头单独用有效位表示
            let len = state.free[lane].len();
            let mut word = 0;
            rx_free_stat::VALID.set(&mut word, u32::from(len > 0));
            rx_free_stat::COUNT.set(&mut word, len.saturating_sub(1) as u32);
            return word;
        }

        match offset {
            offsets::IRQ => {
                let mut word = state.reg(offsets::IRQ) & irq::ENABLE.mask();
                if state.has_completions() {
                    irq::PENDING.set(&mut word, 1);
                }
                word
            }
            offsets::RX_STATUS => fifo_word(state.rx_ret.len()),
            offsets::TX_READ => state.tx_ret.pop_front().unwrap_or(0),
            offsets::RX_READ => state.rx_ret.front().map_or(0, |&(desc_a, _)| desc_a),
            o if o == offsets::RX_READ + 4 => state.rx_ret.pop_front().map_or(0, |(_, desc_b)| desc_b),
            o if o == offsets::TX_STAT + 4 => fifo_word(state.tx_ret.len()),
            _ => state.reg(offset),
        }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        let mut state = self.lock();
        state.writes.push((offset, value));

        if let Some(lane) = index_in(offset, offsets::RX_FREE, LANE_COUNT) {
            state.free[lane].push_back(value);
            return;
        }
        if let Some(lane) = index_in(offset, offsets::TX_WR_B, LANE_COUNT) {
            self.transmit(&mut state, lane, value);
            return;
        }

        state.regs.insert(offset, value);

        if offset == offsets::IRQ && irq::ENABLE.is_set(value) {
            if state.has_completions() {
                self.interrupt(&mut state);
            } else {
                state.handling = false;
                self.idle.notify_all();
            }
        }
    }
}

/// 模拟的调用者地址空间，只有插入过的区域可以访问
#[derive(Default)]
pub struct SimMemory {
    regions: Mutex<BTreeMap<u64, Vec<u8>>>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Vec<u8>>> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 在 `addr` 放入一段内存，覆盖同一起点的旧区域
    pub fn insert(&self, addr: u64, bytes: &[u8]) {
        self.lock().insert(addr, bytes.to_vec());
    }

    /// 读出 `[addr, addr + len)`，无法访问时返回空
    pub fn read_back(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut bytes = vec![0; len];
        match self.read(addr, &mut bytes) {
            Ok(()) => bytes,
            Err(_) => Vec::new(),
        }
    }

    fn with_region<R>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> PgpResult<R> {
        let mut regions = self.lock();
        let (&base, region) = regions
            .range_mut(..=addr)
            .next_back()
            .ok_or(PgpError::Fault(addr))?;

        let start = (addr - base) as usize;
        let end = start.checked_add(len).ok_or(PgpError::Fault(addr))?;
        let window = region.get_mut(start..end).ok_or(PgpError::Fault(addr))?;
        Ok(f(window))
    }
}

impl CallerMemory for SimMemory {
    fn read(&self, addr: u64, dst: &mut [u8]) -> PgpResult<()> {
        self.with_region(addr, dst.len(), |src| dst.copy_from_slice(src))
    }

    fn write(&self, addr: u64, src: &[u8]) -> PgpResult<()> {
        self.with_region(addr, src.len(), |dst| dst.copy_from_slice(src))
    }
}

#[cfg(test)]
impl SimCard {
    /// 以 `count` 个 `size` 字节的缓冲区 attach
    pub fn attach_small(self: &Arc<Self>, count: usize, size: usize) -> Arc<crate::PgpCard> {
        let config = crate::PgpCardConfig::default()
            .with_tx_buffers(count, size)
            .with_rx_buffers(count, size);
        crate::PgpCard::attach("PgpCardG3_0".into(), 0, self.resources(), &config)
            .expect("attach simulated card")
    }

    /// 以默认配置（每方向 32 个 2 MiB 缓冲区）attach
    pub fn attach_default(self: &Arc<Self>) -> Arc<crate::PgpCard> {
        crate::PgpCard::attach(
            "PgpCardG3_0".into(),
            0,
            self.resources(),
            &crate::PgpCardConfig::default(),
        )
        .expect("attach simulated card")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::decode_tx_return;

    #[test]
    fn completion_fifos_pop_in_order() {
        let sim = SimCard::new();
        sim.inject_tx_return(encode_tx_return(0x1000));
        sim.inject_tx_return(encode_tx_return(0x2000));

        assert_eq!(sim.read_u32(offsets::TX_STAT + 4), fifo_word(2));
        assert_eq!(decode_tx_return(sim.read_u32(offsets::TX_READ)), Some(0x1000));
        assert_eq!(decode_tx_return(sim.read_u32(offsets::TX_READ)), Some(0x2000));
        assert_eq!(sim.read_u32(offsets::TX_READ), 0);
    }

    #[test]
    fn rx_descriptor_a_is_peeked_b_pops() {
        let sim = SimCard::new();
        let desc = RxDescriptor {
            lane: 6,
            vc: 1,
            length: 8,
            flags: FrameFlags::EOFE,
            addr: 0x3000,
        };
        sim.inject_rx(desc);

        let a = sim.read_u32(offsets::RX_READ);
        assert_eq!(sim.read_u32(offsets::RX_READ), a);
        let b = sim.read_u32(offsets::RX_READ + 4);
        assert_eq!(RxDescriptor::decode(a, b), Some(desc));
        assert_eq!(sim.read_u32(offsets::RX_READ + 4), 0);
    }

    #[test]
    fn interrupt_pending_tracks_fifos() {
        let sim = SimCard::new();
        sim.write_u32(offsets::IRQ, 1);
        assert_eq!(sim.read_u32(offsets::IRQ), 1);

        sim.inject_tx_return(encode_tx_return(0x1000));
        assert_eq!(sim.read_u32(offsets::IRQ), 0b11);
        sim.read_u32(offsets::TX_READ);
        assert_eq!(sim.read_u32(offsets::IRQ), 1);
    }

    #[test]
    fn sim_memory_bounds() {
        let memory = SimMemory::new();
        memory.insert(0x1000, &[1, 2, 3, 4]);

        let mut buf = [0u8; 2];
        memory.read(0x1002, &mut buf).unwrap();
        assert_eq!(buf, [3, 4]);
        assert_eq!(memory.read(0x1003, &mut buf), Err(PgpError::Fault(0x1003)));
        assert_eq!(memory.read(0x0FFF, &mut buf), Err(PgpError::Fault(0x0FFF)));
        assert!(memory.read_back(0x2000, 4).is_empty());
    }
}
