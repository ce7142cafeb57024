//! 设备
//!
//! 一张已 attach 的板卡：寄存器、两个缓冲区池和对应的环形队列、等待队列、独占打开标志，
//! 以及运行在专用线程上的完成处理器。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use libdriver::{
    DmaAllocator, IrqHandler, IrqLine, PendingSignal, RegisterBus, SpscRing, WaitQueue,
};
use log::{error, info, warn};
use pci_types::{DeviceId, PciAddress, VendorId};

use crate::completion::AsyncNotify;
use crate::config::PgpCardConfig;
use crate::error::{PgpError, PgpResult};
use crate::pool::{BufferPool, Direction};
use crate::regs::{card_rst_stat, irq, rx_max_frame, PgpRegs};
use crate::transfer::{OpenFlags, Session};

/// 探测到的 PCI 设备及其资源
pub struct DeviceResources {
    pub address: PciAddress,
    pub vendor_id: VendorId,
    pub device_id: DeviceId,
    /// BAR0 寄存器窗口
    pub bus: Arc<dyn RegisterBus>,
    /// BAR0 物理地址
    pub base_hdwr: u64,
    /// BAR0 长度
    pub base_len: usize,
    /// 平台投递中断的中断线
    pub irq: Arc<IrqLine>,
    pub dma: Arc<dyn DmaAllocator>,
}

/// 异常计数
#[derive(Debug, Default)]
pub(crate) struct Counters {
    /// 在池中找不到缓冲区的完成描述符
    pub unmatched: AtomicUsize,
    /// 设备未打开时直接归还给硬件的帧
    pub dropped_closed: AtomicUsize,
}

/// 设备标识
#[derive(Debug, Clone, Copy)]
pub(crate) struct Identity {
    pub address: PciAddress,
    pub base_hdwr: u64,
    pub base_len: usize,
}

/// 设备状态，由设备句柄、会话和完成处理器共享
pub(crate) struct Shared {
    pub name: String,
    pub identity: Identity,
    pub regs: PgpRegs,
    pub dma: Arc<dyn DmaAllocator>,

    pub tx_pool: BufferPool,
    pub rx_pool: BufferPool,
    /// 空闲 TX 缓冲区下标（完成处理器生产，写调用消费）
    pub tx_free: SpscRing,
    /// 已填充 RX 缓冲区下标（完成处理器生产，读调用消费）
    pub rx_ready: SpscRing,

    /// 读等待队列
    pub inq: WaitQueue,
    /// 写等待队列
    pub outq: WaitQueue,
    /// poll 等待队列
    pub events: WaitQueue,
    pub signal: PendingSignal,
    /// 异步通知（读就绪时调用）
    pub notify: spin::Mutex<Option<Arc<dyn AsyncNotify>>>,

    pub is_open: AtomicBool,
    pub detached: AtomicBool,
    pub debug: AtomicU32,
    pub counters: Counters,

    /// 完成处理与关闭会话互斥
    pub irq_lock: spin::Mutex<()>,
    /// TX 队列的唯一消费者
    pub tx_consumer: Mutex<()>,
    /// RX 队列的唯一消费者
    pub rx_consumer: Mutex<()>,
}

impl Shared {
    #[inline]
    pub fn debug(&self) -> u32 {
        self.debug.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// 唤醒所有阻塞的调用者
    pub fn wake_all(&self) {
        self.inq.wake_all();
        self.outq.wake_all();
        self.events.wake_all();
    }

    pub fn lock_consumer(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
        lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.regs.rx_max_frame().write(0);

        self.tx_pool.release_all(&*self.dma);
        self.rx_pool.release_all(&*self.dma);

        self.regs
            .card_rst_stat()
            .set_bits(card_rst_stat::CARD_RESET.mask());

        info!("{}: buffers released, card held in reset", self.name);
    }
}

/// 已 attach 的板卡
pub struct PgpCard {
    shared: Arc<Shared>,
    irq: Arc<IrqHandler>,
    worker: spin::Mutex<Option<JoinHandle<()>>>,
    slot: usize,
}

impl PgpCard {
    /// attach 板卡
    ///
    /// 顺序：解除板卡复位、分配 TX 池、分配 RX 池、设置最大帧长、把 RX 缓冲区交给硬件、
    /// 启动完成处理线程、打开中断。任何一步失败都会按相反顺序撤销已完成的步骤。
    pub fn attach(
        name: String,
        slot: usize,
        resources: DeviceResources,
        config: &PgpCardConfig,
    ) -> PgpResult<Arc<Self>> {
        config.validate()?;

        let DeviceResources {
            address,
            bus,
            base_hdwr,
            base_len,
            irq: irq_line,
            dma,
            ..
        } = resources;

        let regs = PgpRegs::new(bus);

        // 解除板卡复位
        regs.card_rst_stat()
            .clear_bits(card_rst_stat::CARD_RESET.mask());
        info!(
            "{}: Probe: Found card. Version={:#x}",
            name,
            regs.version().read()
        );

        let hold_reset = |regs: &PgpRegs| {
            regs.card_rst_stat()
                .set_bits(card_rst_stat::CARD_RESET.mask())
        };

        let mut tx_pool = match BufferPool::allocate(
            Direction::Tx,
            config.tx_buffer_count,
            config.tx_buffer_size,
            &*dma,
        ) {
            Ok(pool) => pool,
            Err(e) => {
                hold_reset(&regs);
                return Err(e);
            }
        };

        let rx_pool = match BufferPool::allocate(
            Direction::Rx,
            config.rx_buffer_count,
            config.rx_buffer_size,
            &*dma,
        ) {
            Ok(pool) => pool,
            Err(e) => {
                tx_pool.release_all(&*dma);
                hold_reset(&regs);
                return Err(e);
            }
        };

        // 最大帧长并使能接收
        let mut max_frame = 0;
        rx_max_frame::SIZE.set(&mut max_frame, config.rx_buffer_size as u32);
        rx_max_frame::ENABLE.set(&mut max_frame, 1);
        regs.rx_max_frame().write(max_frame);

        // RX 缓冲区平均分给各通道的空闲 FIFO
        for (index, buffer) in rx_pool.iter().enumerate() {
            regs.rx_free(index % pgpcard_protocol::LANE_COUNT)
                .write(buffer.dma_addr());
        }

        let tx_count = tx_pool.len();
        let rx_count = rx_pool.len();

        let shared = Arc::new(Shared {
            name: name.clone(),
            identity: Identity {
                address,
                base_hdwr,
                base_len,
            },
            regs,
            dma,
            tx_pool,
            rx_pool,
            tx_free: SpscRing::with_entries(tx_count, 0..tx_count),
            rx_ready: SpscRing::new(rx_count),
            inq: WaitQueue::new(),
            outq: WaitQueue::new(),
            events: WaitQueue::new(),
            signal: PendingSignal::new(),
            notify: spin::Mutex::new(None),
            is_open: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            debug: AtomicU32::new(config.debug),
            counters: Counters::default(),
            irq_lock: spin::Mutex::new(()),
            tx_consumer: Mutex::new(()),
            rx_consumer: Mutex::new(()),
        });

        let handler = Arc::new(IrqHandler::new(irq_line));
        let worker = {
            let shared = shared.clone();
            handler.spawn(format!("{}-irq", name), move || {
                shared.handle_interrupt();
                true
            })
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                error!("{}: Init: Unable to start interrupt handler: {:?}", name, e);
                // 释放由 Shared 的析构完成
                return Err(e.into());
            }
        };

        shared.regs.irq().write(irq::ENABLE.encode(1));
        info!(
            "{}: Init: Driver is loaded. IRQ {}, {} tx / {} rx buffers",
            name,
            handler.line().irq_number(),
            tx_count,
            rx_count
        );

        Ok(Arc::new(Self {
            shared,
            irq: handler,
            worker: spin::Mutex::new(Some(worker)),
            slot,
        }))
    }

    /// 设备名
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 注册表槽位
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn address(&self) -> PciAddress {
        self.shared.identity.address
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    pub fn is_detached(&self) -> bool {
        self.shared.is_detached()
    }

    /// 当前调试级别
    pub fn debug_level(&self) -> u32 {
        self.shared.debug()
    }

    /// 打开会话，同一时间只允许一个会话
    pub fn open(&self, flags: OpenFlags) -> PgpResult<Session> {
        if self.shared.is_detached() {
            return Err(PgpError::NoDevice);
        }

        if self
            .shared
            .is_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(
                "{}: Open: module open failed. Device is already open",
                self.shared.name
            );
            return Err(PgpError::Busy);
        }

        // 丢弃上一个会话残留的取消信号
        self.shared.signal.take();
        Ok(Session::new(self.shared.clone(), flags))
    }

    /// 停止设备：关闭中断、停止完成处理线程、唤醒所有阻塞调用者
    ///
    /// 可重复调用。缓冲区在最后一个会话关闭后释放。
    pub fn detach(&self) {
        if self.shared.detached.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.regs.irq().write(0);
        self.irq.stop();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("{}: interrupt handler panicked", self.shared.name);
            }
        }

        self.shared.wake_all();
        info!("{}: detached", self.shared.name);
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for PgpCard {
    fn drop(&mut self) {
        self.detach();
    }
}
