//! 完成处理
//!
//! 每次中断调用一次：关闭中断，依次排空 TX 和 RX 完成 FIFO，再重新打开中断。
//! 处理过程不阻塞、不分配内存，也是两个环形队列生产端的唯一写者。

use core::sync::atomic::Ordering;

use libdriver::{PollFlags, PushOutcome};
use log::{debug, warn};

use crate::device::Shared;
use crate::pool::FrameMeta;
use crate::regs::{decode_tx_return, fifo_status, irq, RxDescriptor};

/// 异步通知接收者
///
/// 每收到一帧就以 [`PollFlags::READABLE`] 调用一次。在完成处理器中执行，不能阻塞。
pub trait AsyncNotify: Send + Sync {
    fn notify(&self, events: PollFlags);
}

impl<F> AsyncNotify for F
where
    F: Fn(PollFlags) + Send + Sync,
{
    fn notify(&self, events: PollFlags) {
        self(events)
    }
}

/// 中断处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// 不是本卡的中断
    NotMine,
    /// 已处理
    Handled,
}

impl Shared {
    /// 处理一次中断
    pub(crate) fn handle_interrupt(&self) -> IrqReturn {
        let _guard = self.irq_lock.lock();

        let stat = self.regs.irq().read();
        if !irq::PENDING.is_set(stat) {
            return IrqReturn::NotMine;
        }

        if self.debug() > 0 {
            debug!("{}: Irq: IRQ Called. Stat={:#x}", self.name, stat);
        }

        // 处理期间关闭中断
        self.regs.irq().write(0);

        self.drain_tx();
        self.drain_rx();

        self.regs.irq().write(irq::ENABLE.encode(1));
        IrqReturn::Handled
    }

    fn drain_tx(&self) {
        if !fifo_status::READY.is_set(self.regs.tx_stat(1).read()) {
            return;
        }

        while let Some(addr) = decode_tx_return(self.regs.tx_read().read()) {
            let Some(index) = self.tx_pool.find(addr) else {
                self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                warn!("{}: Irq: Failed to locate TX descriptor {:#010x}", self.name, addr);
                continue;
            };

            if self.tx_free.push(index) == PushOutcome::Collision {
                warn!("{}: Irq: TX queue pointer collision", self.name);
            }

            if self.debug() > 1 {
                debug!("{}: Irq: Return TX buffer {} at {:#010x}", self.name, index, addr);
            }

            self.outq.wake_all();
            self.events.wake_all();
        }
    }

    fn drain_rx(&self) {
        if !fifo_status::READY.is_set(self.regs.rx_status().read()) {
            return;
        }

        loop {
            // A 必须先于 B 读取，读 B 会弹出 FIFO
            let desc_a = self.regs.rx_read(0).read();
            let desc_b = self.regs.rx_read(1).read();
            let Some(desc) = RxDescriptor::decode(desc_a, desc_b) else {
                break;
            };

            let Some(index) = self.rx_pool.find(desc.addr) else {
                self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{}: Irq: Failed to locate RX descriptor {:#010x}",
                    self.name, desc.addr
                );
                continue;
            };

            // 没有读者时直接把缓冲区还给硬件
            if !self.is_open() {
                self.regs
                    .rx_free(desc.lane as usize % pgpcard_protocol::LANE_COUNT)
                    .write(desc.addr);
                self.counters.dropped_closed.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.rx_pool.buffer(index).set_meta(FrameMeta {
                lane: desc.lane,
                vc: desc.vc,
                length: desc.length,
                flags: desc.flags,
            });

            if self.rx_ready.push(index) == PushOutcome::Collision {
                warn!("{}: Irq: RX queue pointer collision", self.name);
            }

            if self.debug() > 1 {
                debug!(
                    "{}: Irq: Rx Bytes={}, Lane={}, Vc={}, Addr={:#010x}",
                    self.name,
                    desc.length as usize * pgpcard_protocol::WORD_SIZE,
                    desc.lane,
                    desc.vc,
                    desc.addr
                );
            }

            self.inq.wake_all();
            self.events.wake_all();

            let notify = self.notify.lock().clone();
            if let Some(notify) = notify {
                notify.notify(PollFlags::READABLE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use crate::protocol::{Command, FrameFlags};
    use crate::regs::{encode_tx_return, offsets};
    use crate::sim::SimCard;
    use crate::transfer::OpenFlags;

    use super::*;

    #[test]
    fn foreign_interrupt_is_not_mine() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);

        let writes = sim.write_count();
        assert_eq!(card.shared().handle_interrupt(), IrqReturn::NotMine);
        // 没有碰任何寄存器
        assert_eq!(sim.write_count(), writes);
    }

    #[test]
    fn unmatched_descriptors_are_counted_and_skipped() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);
        let session = card.open(OpenFlags::NONBLOCK).unwrap();

        sim.inject_tx_return(encode_tx_return(0x0000_1000));
        sim.inject_rx(RxDescriptor {
            lane: 1,
            vc: 0,
            length: 4,
            flags: FrameFlags::empty(),
            addr: 0x0000_2000,
        });
        assert!(sim.wait_idle());

        let diag = session.diagnostics();
        assert_eq!(diag.unmatched, 2);
        assert_eq!(diag.rx_queued, 0);
        // 中断重新打开
        assert_eq!(sim.peek(offsets::IRQ) & 1, 1);
    }

    #[test]
    fn received_frames_fire_the_async_notification() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);
        let session = card.open(OpenFlags::NONBLOCK).unwrap();
        session.control(Command::SetLoop, 1).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let notify: Arc<dyn AsyncNotify> = Arc::new(move |events: PollFlags| {
            if events == PollFlags::READABLE {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
        session.set_async_notify(Some(notify));

        session.send(1, 0, &[1, 2, 3]).unwrap();
        session.send(1, 0, &[4]).unwrap();
        assert!(sim.wait_idle());
        assert_eq!(fired.load(Ordering::Relaxed), 2);

        // 关闭会话时注销
        drop(session);
        assert!(card.shared().notify.lock().is_none());
    }

    #[test]
    fn frames_arriving_while_closed_go_back_to_hardware() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);
        let addr = sim.take_free_buffer(2).unwrap();

        sim.inject_rx(RxDescriptor {
            lane: 2,
            vc: 3,
            length: 16,
            flags: FrameFlags::empty(),
            addr,
        });
        assert!(sim.wait_idle());

        assert!(card.shared().rx_ready.is_empty());
        assert_eq!(card.shared().counters.dropped_closed.load(Ordering::Relaxed), 1);
        assert!(sim.free_fifo(2).contains(&addr));
    }
}
