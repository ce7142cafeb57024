//! 状态快照
//!
//! 一次遍历寄存器窗口，把每个位域解码进 [`PgpCardStatus`]。

use pgpcard_protocol::{PgpCardStatus, LANE_COUNT, VC_COUNT};

use crate::device::{PgpCard, Shared};
use crate::regs::{
    card_rst_stat, evr_card_stat, evr_code, fifo_status, lane_stat, pci_stat, pgp_card_stat,
    rx_free_stat, tx_stat,
};
use crate::SPAD_WRITE;

impl Shared {
    /// 读取状态快照
    ///
    /// 暂存寄存器先写入自检值再读回，读回值不等于 [`SPAD_WRITE`] 说明寄存器通路异常。
    pub(crate) fn snapshot(&self) -> PgpCardStatus {
        let regs = &self.regs;
        let mut stat = PgpCardStatus::default();

        regs.scratch().write(SPAD_WRITE);

        stat.version = regs.version().read();
        stat.scratch_pad = regs.scratch().read();
        stat.serial_number = [regs.ser_num_upper().read(), regs.ser_num_lower().read()];

        for (index, word) in stat.build_stamp.0.iter_mut().enumerate() {
            *word = regs.build_stamp(index).read();
        }

        let rst = regs.card_rst_stat().read();
        stat.count_reset = card_rst_stat::COUNT_RESET.get(rst);
        stat.card_reset = card_rst_stat::CARD_RESET.get(rst);

        stat.pgp_rate = regs.pgp_rate().read();

        // PCI
        let split = |word: u32| (pci_stat::COMMAND.get(word), pci_stat::STATUS.get(word));
        (stat.pci_command, stat.pci_status) = split(regs.pci_stat(0).read());
        (stat.pci_d_command, stat.pci_d_status) = split(regs.pci_stat(1).read());
        (stat.pci_l_command, stat.pci_l_status) = split(regs.pci_stat(2).read());

        let link = regs.pci_stat(3).read();
        stat.pci_link_state = pci_stat::LINK_STATE.get(link);
        stat.pci_function = pci_stat::FUNCTION.get(link);
        stat.pci_device = pci_stat::DEVICE.get(link);
        stat.pci_bus = pci_stat::BUS.get(link);

        // 记录中的基地址字段只有 32 位
        stat.pci_base_hdwr = self.identity.base_hdwr as u32;
        stat.pci_base_len = self.identity.base_len as u32;

        // EVR
        let evr = regs.evr_card_stat(0).read();
        stat.evr_ready = evr_card_stat::READY.get(evr);
        stat.evr_err_cnt = evr_card_stat::ERR_CNT.get(evr);

        let evr = regs.evr_card_stat(1).read();
        stat.evr_pll_rst = evr_card_stat::PLL_RST.get(evr);
        stat.evr_reset = evr_card_stat::RESET.get(evr);
        stat.evr_enable = evr_card_stat::ENABLE.get(evr);

        let mask = regs.evr_card_stat(2).read();
        for lane in 0..LANE_COUNT {
            for vc in 0..VC_COUNT {
                stat.evr_en_hdr_check[lane][vc] = evr_card_stat::EN_HDR_CHECK
                    .shifted(lane * VC_COUNT + vc)
                    .get(mask);
            }
            stat.evr_run_code[lane] = evr_code::CODE.get(regs.run_code(lane).read());
            stat.evr_accept_code[lane] = evr_code::CODE.get(regs.accept_code(lane).read());
            stat.evr_run_delay[lane] = regs.run_delay(lane).read();
            stat.evr_accept_delay[lane] = regs.accept_delay(lane).read();
        }

        // PGP
        let card = regs.pgp_card_stat(0).read();
        for pll in 0..pgp_card_stat::PLL_COUNT {
            stat.pgp_tx_pll_rdy[pll] = pgp_card_stat::TX_PLL_RDY.shifted(pll).get(card);
            stat.pgp_rx_pll_rdy[pll] = pgp_card_stat::RX_PLL_RDY.shifted(pll).get(card);
            stat.pgp_tx_pll_rst[pll] = pgp_card_stat::TX_PLL_RST.shifted(pll).get(card);
            stat.pgp_rx_pll_rst[pll] = pgp_card_stat::RX_PLL_RST.shifted(pll).get(card);
        }
        for lane in 0..LANE_COUNT {
            stat.pgp_tx_reset[lane] = pgp_card_stat::TX_RESET.shifted(lane).get(card);
            stat.pgp_rx_reset[lane] = pgp_card_stat::RX_RESET.shifted(lane).get(card);
            stat.pgp_loop_back[lane] = pgp_card_stat::LOOP_BACK.shifted(lane).get(card);
        }

        let link = regs.pgp_card_stat(1).read();
        for lane in 0..LANE_COUNT {
            stat.pgp_rem_link_ready[lane] = pgp_card_stat::REM_LINK_READY.shifted(lane).get(link);
            stat.pgp_loc_link_ready[lane] = pgp_card_stat::LOC_LINK_READY.shifted(lane).get(link);
        }

        for lane in 0..LANE_COUNT {
            let word = regs.pgp_lane_stat(lane).read();
            stat.pgp_link_err_cnt[lane] = lane_stat::LINK_ERR_CNT.get(word);
            stat.pgp_link_down_cnt[lane] = lane_stat::LINK_DOWN_CNT.get(word);
            stat.pgp_cell_err_cnt[lane] = lane_stat::CELL_ERR_CNT.get(word);
            stat.pgp_fifo_err_cnt[lane] = lane_stat::FIFO_ERR_CNT.get(word);
            for vc in 0..VC_COUNT {
                stat.pgp_rx_count[lane][vc] = lane_stat::RX_COUNT.shifted(vc).get(word);
            }
        }

        // RX
        for lane in 0..LANE_COUNT {
            let word = regs.rx_free_stat(lane).read();
            stat.rx_free_full[lane] = rx_free_stat::FULL.get(word);
            stat.rx_free_valid[lane] = rx_free_stat::VALID.get(word);
            stat.rx_free_fifo_count[lane] = rx_free_stat::COUNT.get(word);
        }

        stat.rx_count = regs.rx_count().read();
        stat.rx_write = self.rx_ready.write_index() as u32;
        stat.rx_read = self.rx_ready.read_index() as u32;

        let rx = regs.rx_status().read();
        stat.rx_read_ready = fifo_status::READY.get(rx);
        stat.rx_ret_fifo_count = fifo_status::COUNT.get(rx);

        // TX
        let full = regs.tx_stat(0).read();
        for lane in 0..LANE_COUNT {
            stat.tx_dma_a_full[lane] = tx_stat::DMA_A_FULL.shifted(lane).get(full);
        }

        let tx = regs.tx_stat(1).read();
        stat.tx_read_ready = fifo_status::READY.get(tx);
        stat.tx_ret_fifo_count = fifo_status::COUNT.get(tx);

        stat.tx_count = regs.tx_count().read();
        stat.tx_write = self.tx_free.write_index() as u32;
        stat.tx_read = self.tx_free.read_index() as u32;

        for lane in 0..LANE_COUNT {
            stat.tx_fifo_cnt[lane] = regs.tx_fifo_cnt(lane).read();
        }

        stat
    }
}

impl PgpCard {
    /// 读取状态快照，不需要打开设备
    pub fn status(&self) -> PgpCardStatus {
        self.shared().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use crate::regs::offsets;
    use crate::sim::SimCard;

    use super::*;

    #[test]
    fn scratchpad_self_test_round_trips() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);

        let stat = card.status();
        assert_eq!(stat.scratch_pad, SPAD_WRITE);
        assert!(sim.writes().contains(&(offsets::SCRATCH, SPAD_WRITE)));
    }

    #[test]
    fn fields_decode_from_live_registers() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);

        sim.poke(offsets::VERSION, 0xCE30_0012);
        sim.poke(offsets::SER_NUM_UPPER, 0x1111);
        sim.poke(offsets::SER_NUM_LOWER, 0x2222);
        sim.poke(offsets::PCI_STAT, 0xA5B4_C3D2);
        sim.poke(offsets::PCI_STAT + 12, (5 << 24) | (1 << 16) | (0x1F << 8) | 0x42);
        sim.poke(offsets::PGP_CARD_STAT, 0x8004_0201);
        sim.poke(offsets::PGP_CARD_STAT + 4, 0x0000_8001);
        sim.poke(offsets::PGP_LANE_STAT + 3 * 4, 0x1234_5678);
        sim.poke(offsets::EVR_CARD_STAT + 8, 1 << (4 * 2 + 1));
        sim.poke(offsets::RUN_CODE + 4, 0x1FF);
        sim.poke(offsets::TX_FIFO_CNT + 7 * 4, 99);
        for (index, byte) in b"PgpCardG3".iter().enumerate() {
            let offset = offsets::BUILD_STAMP + (index / 4) * 4;
            let word = sim.peek(offset) | (u32::from(*byte) << ((index % 4) * 8));
            sim.poke(offset, word);
        }

        let stat = card.status();
        assert_eq!(stat.version, 0xCE30_0012);
        assert_eq!(stat.serial_number, [0x1111, 0x2222]);
        assert_eq!((stat.pci_command, stat.pci_status), (0xA5B4, 0xC3D2));
        assert_eq!(stat.pci_link_state, 5);
        assert_eq!(stat.pci_function, 1);
        assert_eq!(stat.pci_device, 0x1F);
        assert_eq!(stat.pci_bus, 0x42);

        assert_eq!(stat.pgp_loop_back[0], 1);
        assert_eq!(stat.pgp_rx_reset[1], 1);
        assert_eq!(stat.pgp_tx_reset[2], 1);
        assert_eq!(stat.pgp_tx_pll_rdy, [0, 1]);
        assert_eq!(stat.pgp_loc_link_ready[0], 1);
        assert_eq!(stat.pgp_rem_link_ready[7], 1);

        assert_eq!(stat.pgp_link_err_cnt[3], 0x1);
        assert_eq!(stat.pgp_link_down_cnt[3], 0x2);
        assert_eq!(stat.pgp_cell_err_cnt[3], 0x3);
        assert_eq!(stat.pgp_fifo_err_cnt[3], 0x4);
        assert_eq!(stat.pgp_rx_count[3], [0x8, 0x7, 0x6, 0x5]);

        assert_eq!(stat.evr_en_hdr_check[2][1], 1);
        assert_eq!(stat.evr_en_hdr_check[2][0], 0);
        assert_eq!(stat.evr_run_code[1], 0xFF);
        assert_eq!(stat.tx_fifo_cnt[7], 99);
        assert_eq!(stat.build_stamp.as_string(), "PgpCardG3");

        // attach 之后卡已解除复位
        assert_eq!(stat.card_reset, 0);
        assert_eq!(stat.pci_base_len as usize, offsets::REGION_SIZE);
    }

    #[test]
    fn ring_indices_and_free_fifo_counts() {
        let sim = SimCard::new();
        let card = sim.attach_small(16, 4096);

        let stat = card.status();
        // 16 个 RX 缓冲区平均分给 8 个 FIFO
        for lane in 0..LANE_COUNT {
            assert_eq!(stat.rx_free_valid[lane], 1);
            assert_eq!(stat.rx_free_fifo_count[lane], 1);
        }
        assert_eq!(stat.tx_write, 16);
        assert_eq!(stat.tx_read, 0);
        assert_eq!(stat.rx_write, stat.rx_read);
    }
}
