//! 控制命令
//!
//! 写入记录的命令字段不是普通写时走到这里。立即参数按 32 位解释，通道号取低 3 位。

use core::sync::atomic::Ordering;

use log::{debug, warn};
use pgpcard_protocol::{Command, PgpCardStatus, LANE_COUNT};

use crate::device::{PgpCard, Shared};
use crate::error::{PgpError, PgpResult};
use crate::pool::FrameMeta;
use crate::regs::{card_rst_stat, evr_card_stat, pgp_card_stat, rx_free_stat};

/// 控制命令结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Done,
    /// 状态快照，由调用者写回数据指针
    Status(Box<PgpCardStatus>),
}

/// 内部诊断信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// RX 队列中等待读取的缓冲区
    pub rx_queued: usize,
    pub rx_buffers: usize,
    /// 硬件 RX 空闲 FIFO 中的缓冲区
    pub rx_fifo: usize,
    /// TX 队列中的空闲缓冲区
    pub tx_queued: usize,
    pub tx_buffers: usize,
    /// TX 队列内容（总线地址，从队头开始）
    pub tx_queue: Vec<u32>,
    /// 不在 TX 队列中的缓冲区（正在发送）
    pub tx_missing: Vec<(u32, FrameMeta)>,
    /// 找不到缓冲区的完成描述符
    pub unmatched: usize,
    /// 两个队列累计的指针冲突
    pub collisions: usize,
    /// 设备未打开时归还给硬件的帧
    pub dropped_closed: usize,
}

/// 执行控制命令
pub(crate) fn execute(shared: &Shared, command: Command, arg: u64) -> PgpResult<ControlReply> {
    let regs = &shared.regs;
    let arg = arg as u32;
    let lane = arg as usize % LANE_COUNT;

    match command {
        Command::NormalWrite => return Err(PgpError::UnknownCommand(command.code())),

        Command::ReadStatus => {
            if shared.debug() > 0 {
                debug!("{}: ReadStatus", shared.name);
            }
            return Ok(ControlReply::Status(Box::new(shared.snapshot())));
        }

        Command::CountReset => {
            let bit = card_rst_stat::COUNT_RESET.mask();
            regs.card_rst_stat().set_bits(bit);
            regs.card_rst_stat().clear_bits(bit);
        }
        Command::PgpOpCode => regs.pgp_op_code().write(arg),

        Command::SetLoop => regs
            .pgp_card_stat(0)
            .set_bits(pgp_card_stat::LOOP_BACK.shifted(lane).mask()),
        Command::ClrLoop => regs
            .pgp_card_stat(0)
            .clear_bits(pgp_card_stat::LOOP_BACK.shifted(lane).mask()),
        Command::SetRxReset => regs
            .pgp_card_stat(0)
            .set_bits(pgp_card_stat::RX_RESET.shifted(lane).mask()),
        Command::ClrRxReset => regs
            .pgp_card_stat(0)
            .clear_bits(pgp_card_stat::RX_RESET.shifted(lane).mask()),
        Command::SetTxReset => regs
            .pgp_card_stat(0)
            .set_bits(pgp_card_stat::TX_RESET.shifted(lane).mask()),
        Command::ClrTxReset => regs
            .pgp_card_stat(0)
            .clear_bits(pgp_card_stat::TX_RESET.shifted(lane).mask()),

        Command::EvrEnable => regs.evr_card_stat(1).set_bits(evr_card_stat::ENABLE.mask()),
        Command::EvrDisable => regs.evr_card_stat(1).clear_bits(evr_card_stat::ENABLE.mask()),
        Command::EvrSetReset => regs.evr_card_stat(1).set_bits(evr_card_stat::RESET.mask()),
        Command::EvrClrReset => regs.evr_card_stat(1).clear_bits(evr_card_stat::RESET.mask()),
        Command::EvrSetPllRst => regs.evr_card_stat(1).set_bits(evr_card_stat::PLL_RST.mask()),
        Command::EvrClrPllRst => regs.evr_card_stat(1).clear_bits(evr_card_stat::PLL_RST.mask()),
        Command::EvrMask => regs.evr_card_stat(2).write(arg),

        Command::EvrRunCode(index) => regs.run_code(evr_index(command, index)?).write(arg),
        Command::EvrAcceptCode(index) => regs.accept_code(evr_index(command, index)?).write(arg),
        Command::EvrRunDelay(index) => regs.run_delay(evr_index(command, index)?).write(arg),
        Command::EvrAcceptDelay(index) => {
            regs.accept_delay(evr_index(command, index)?).write(arg)
        }

        Command::Nop => warn!("{}: NOP to {}", shared.name, arg),
        Command::SetDebug => {
            shared.debug.store(arg, Ordering::Relaxed);
            warn!("{}: debug set to {}", shared.name, arg);
        }
        Command::DumpDebug => dump_debug(shared),
    }

    if shared.debug() > 0 {
        debug!("{}: {:?} arg={:#x}", shared.name, command, arg);
    }

    Ok(ControlReply::Done)
}

fn evr_index(command: Command, index: u8) -> PgpResult<usize> {
    let index = usize::from(index);
    if index >= 8 {
        return Err(PgpError::UnknownCommand(command.code()));
    }
    Ok(index)
}

/// 收集诊断信息
pub(crate) fn diagnostics(shared: &Shared) -> Diagnostics {
    let rx_fifo = (0..LANE_COUNT)
        .map(|lane| {
            let word = shared.regs.rx_free_stat(lane).read();
            rx_free_stat::VALID.get(word) as usize + rx_free_stat::COUNT.get(word) as usize
        })
        .sum();

    let queued = shared.tx_free.snapshot();
    let tx_queue: Vec<u32> = queued
        .iter()
        .filter(|&&index| index < shared.tx_pool.len())
        .map(|&index| shared.tx_pool.buffer(index).dma_addr())
        .collect();
    let tx_missing = shared
        .tx_pool
        .iter()
        .filter(|buffer| !tx_queue.contains(&buffer.dma_addr()))
        .map(|buffer| (buffer.dma_addr(), buffer.meta()))
        .collect();

    Diagnostics {
        rx_queued: shared.rx_ready.len(),
        rx_buffers: shared.rx_pool.len(),
        rx_fifo,
        tx_queued: queued.len(),
        tx_buffers: shared.tx_pool.len(),
        tx_queue,
        tx_missing,
        unmatched: shared.counters.unmatched.load(Ordering::Relaxed),
        collisions: shared.tx_free.collisions() + shared.rx_ready.collisions(),
        dropped_closed: shared.counters.dropped_closed.load(Ordering::Relaxed),
    }
}

fn dump_debug(shared: &Shared) {
    if shared.debug() == 0 {
        warn!(
            "{}: attempt to dump debug with debug level of zero",
            shared.name
        );
        return;
    }

    let diag = diagnostics(shared);
    let name = &shared.name;

    debug!(
        "{}: Rx Queue contains {} out of {} buffers",
        name, diag.rx_queued, diag.rx_buffers
    );
    debug!(
        "{}: Rx Fifo contains {} out of {} buffers",
        name, diag.rx_fifo, diag.rx_buffers
    );
    debug!(
        "{}: Tx Queue contains {} out of {} buffers",
        name, diag.tx_queued, diag.tx_buffers
    );
    for (addr, meta) in &diag.tx_missing {
        debug!(
            "{}: Tx Buffer {:#010x} is missing! Lane={}, Vc={}, Length={}",
            name, addr, meta.lane, meta.vc, meta.length
        );
    }
    for addr in &diag.tx_queue {
        debug!("{}: Tx Queue Entry {:#010x}", name, addr);
    }
    debug!(
        "{}: unmatched={}, collisions={}, dropped while closed={}",
        name, diag.unmatched, diag.collisions, diag.dropped_closed
    );
}

impl PgpCard {
    /// 诊断信息，不需要打开设备
    pub fn diagnostics(&self) -> Diagnostics {
        diagnostics(self.shared())
    }
}

#[cfg(test)]
mod tests {
    use crate::regs::offsets;
    use crate::sim::SimCard;

    use super::*;

    fn run(shared: &Shared, command: Command, arg: u64) {
        assert_eq!(execute(shared, command, arg), Ok(ControlReply::Done));
    }

    #[test]
    fn lane_bits_follow_the_argument() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);
        let shared = card.shared();

        run(shared, Command::SetLoop, 3);
        run(shared, Command::SetRxReset, 2);
        run(shared, Command::SetTxReset, 7);
        assert_eq!(sim.peek(offsets::PGP_CARD_STAT), (1 << 3) | (1 << 10) | (1 << 23));

        // 通道号只取低 3 位
        run(shared, Command::ClrLoop, 0x1_0000_000B);
        run(shared, Command::ClrTxReset, 7);
        assert_eq!(sim.peek(offsets::PGP_CARD_STAT), 1 << 10);
    }

    #[test]
    fn evr_controls_and_codes() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);
        let shared = card.shared();

        run(shared, Command::EvrEnable, 0);
        run(shared, Command::EvrSetPllRst, 0);
        assert_eq!(sim.peek(offsets::EVR_CARD_STAT + 4), 0b101);
        run(shared, Command::EvrDisable, 0);
        run(shared, Command::EvrSetReset, 0);
        assert_eq!(sim.peek(offsets::EVR_CARD_STAT + 4), 0b110);

        run(shared, Command::EvrMask, 0xF0F0);
        assert_eq!(sim.peek(offsets::EVR_CARD_STAT + 8), 0xF0F0);

        run(shared, Command::EvrRunCode(5), 0x2A);
        run(shared, Command::EvrAcceptDelay(7), 1000);
        run(shared, Command::PgpOpCode, 0x77);
        assert_eq!(sim.peek(offsets::RUN_CODE + 5 * 4), 0x2A);
        assert_eq!(sim.peek(offsets::ACCEPT_DELAY + 7 * 4), 1000);
        assert_eq!(sim.peek(offsets::PGP_OP_CODE), 0x77);

        assert_eq!(
            execute(shared, Command::EvrRunDelay(8), 1),
            Err(PgpError::UnknownCommand(0x48))
        );
    }

    #[test]
    fn count_reset_pulses() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);

        run(card.shared(), Command::CountReset, 0);
        let writes: Vec<u32> = sim
            .writes()
            .into_iter()
            .filter(|&(offset, _)| offset == offsets::CARD_RST_STAT)
            .map(|(_, value)| value)
            .collect();
        // 解除板卡复位，置位计数复位，再清除
        assert_eq!(writes[writes.len() - 2..], [1, 0]);
    }

    #[test]
    fn debug_level_and_diagnostics() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);
        let shared = card.shared();

        let writes = sim.write_count();
        run(shared, Command::Nop, 0);
        run(shared, Command::DumpDebug, 0);
        run(shared, Command::SetDebug, 3);
        run(shared, Command::DumpDebug, 0);
        assert_eq!(card.debug_level(), 3);
        // 这些命令都不写寄存器
        assert_eq!(sim.write_count(), writes);

        let diag = card.diagnostics();
        assert_eq!(diag.tx_buffers, 4);
        assert_eq!(diag.tx_queued, 4);
        assert!(diag.tx_missing.is_empty());
        assert_eq!(diag.rx_fifo, 4);
        assert_eq!(diag.rx_queued, 0);
    }

    #[test]
    fn read_status_returns_a_snapshot() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);

        match execute(card.shared(), Command::ReadStatus, 0) {
            Ok(ControlReply::Status(stat)) => assert_eq!(stat.scratch_pad, crate::SPAD_WRITE),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(
            execute(card.shared(), Command::NormalWrite, 0),
            Err(PgpError::UnknownCommand(0))
        );
    }
}
