//! DMA 内存管理
//!
//! 设备可直接访问的内存区域，以及按总线地址分配这些区域的分配器。

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{error, warn};
use spin::Mutex;

use crate::{DriverError, Result};

/// 页大小
pub const PAGE_SIZE: usize = 4096;

/// 物理（总线）地址类型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const NULL: PhysAddr = PhysAddr(0);

    #[inline]
    pub fn new(addr: u64) -> Self {
        PhysAddr(addr)
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// 32 位设备可寻址时返回低 32 位
    #[inline]
    pub fn as_u32(&self) -> Option<u32> {
        u32::try_from(self.0).ok()
    }

    #[inline]
    pub fn add(&self, offset: usize) -> Self {
        PhysAddr(self.0 + offset as u64)
    }
}

/// DMA 内存区域
///
/// 设备通过 `phys_addr` 访问、驱动通过 `virt_addr` 访问的同一块内存。
/// 区域不会自动释放，必须交还给分配它的 [`DmaAllocator`]。
#[must_use]
pub struct DmaRegion {
    /// 虚拟地址
    virt_addr: NonNull<u8>,
    /// 物理地址
    phys_addr: PhysAddr,
    /// 大小
    size: usize,
}

impl DmaRegion {
    /// 由分配器构造区域
    ///
    /// # 安全性
    /// `virt_addr` 必须指向至少 `size` 字节的可读写内存，在区域被释放前保持有效，
    /// 并且设备通过 `phys_addr` 访问的正是这块内存。
    pub unsafe fn from_raw_parts(virt_addr: NonNull<u8>, phys_addr: PhysAddr, size: usize) -> Self {
        Self {
            virt_addr,
            phys_addr,
            size,
        }
    }

    /// 获取虚拟地址
    #[inline]
    pub fn virt_addr(&self) -> *mut u8 {
        self.virt_addr.as_ptr()
    }

    /// 获取物理地址
    #[inline]
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys_addr
    }

    /// 获取大小
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(DriverError::BufferTooSmall),
        }
    }

    /// 以字节切片访问 `[offset, offset + len)`
    ///
    /// # 安全性
    /// 切片存活期间，设备和其他线程都不能写这段内存。
    #[inline]
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        Ok(core::slice::from_raw_parts(self.virt_addr.as_ptr().add(offset), len))
    }

    /// 以可变字节切片访问 `[offset, offset + len)`
    ///
    /// # 安全性
    /// 切片存活期间，设备和其他线程都不能访问这段内存。
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check_range(offset, len)?;
        Ok(core::slice::from_raw_parts_mut(self.virt_addr.as_ptr().add(offset), len))
    }

    /// 清零
    pub fn zero(&mut self) {
        unsafe {
            core::ptr::write_bytes(self.virt_addr.as_ptr(), 0, self.size);
        }
    }
}

// 实现 Send 和 Sync
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

/// DMA 分配器
pub trait DmaAllocator: Send + Sync {
    /// 分配至少 `size` 字节、页对齐的 DMA 区域
    fn allocate(&self, size: usize) -> Result<DmaRegion>;

    /// 释放 DMA 区域
    fn release(&self, region: DmaRegion);
}

/// 分配统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// 累计分配次数
    pub allocated: usize,
    /// 累计释放次数
    pub released: usize,
    /// 当前存活字节数
    pub live_bytes: usize,
}

impl AllocStats {
    /// 当前存活区域数量
    pub fn live(&self) -> usize {
        self.allocated - self.released
    }
}

struct Mapping {
    virt: usize,
    size: usize,
}

struct Window {
    next: u64,
    limit: u64,
    /// 已释放、可复用的总线地址段：大小 -> 起始地址
    recycled: BTreeMap<usize, Vec<u64>>,
    live: BTreeMap<u64, Mapping>,
}

/// 主机内存 DMA 分配器
///
/// 以页对齐的堆内存作为 DMA 区域，并在 32 位总线地址窗口中为其分配地址，
/// 相当于一个恒等映射之外的 IOMMU。分配与释放次数可通过 [`HostDmaAllocator::stats`] 查询。
pub struct HostDmaAllocator {
    window: Mutex<Window>,
    allocated: AtomicUsize,
    released: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl HostDmaAllocator {
    /// 默认总线地址窗口起点
    pub const DEFAULT_WINDOW_BASE: u64 = 0x1000_0000;
    /// 默认总线地址窗口终点（32 位可寻址）
    pub const DEFAULT_WINDOW_LIMIT: u64 = 0x1_0000_0000;

    pub fn new() -> Self {
        Self::with_window(Self::DEFAULT_WINDOW_BASE, Self::DEFAULT_WINDOW_LIMIT)
    }

    /// 使用指定总线地址窗口
    pub fn with_window(base: u64, limit: u64) -> Self {
        Self {
            window: Mutex::new(Window {
                next: base,
                limit,
                recycled: BTreeMap::new(),
                live: BTreeMap::new(),
            }),
            allocated: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// 获取统计信息
    pub fn stats(&self) -> AllocStats {
        AllocStats {
            allocated: self.allocated.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
            live_bytes: self.live_bytes.load(Ordering::Acquire),
        }
    }

    /// 以设备视角访问总线地址 `[addr, addr + len)`
    ///
    /// 地址不落在任何存活区域内时返回 `None`。
    pub fn with_bus_memory<R>(
        &self,
        addr: PhysAddr,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        let window = self.window.lock();
        let (&base, mapping) = window.live.range(..=addr.as_u64()).next_back()?;
        let offset = (addr.as_u64() - base) as usize;
        if offset.checked_add(len)? > mapping.size {
            return None;
        }

        let slice = unsafe { core::slice::from_raw_parts_mut((mapping.virt + offset) as *mut u8, len) };
        Some(f(slice))
    }

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size, PAGE_SIZE).map_err(|_| DriverError::InvalidArgument)
    }
}

impl Default for HostDmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HostDmaAllocator {
    fn allocate(&self, size: usize) -> Result<DmaRegion> {
        if size == 0 {
            return Err(DriverError::InvalidArgument);
        }

        let aligned_size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let layout = Self::layout(aligned_size)?;

        let mut window = self.window.lock();

        let bus = match window.recycled.get_mut(&aligned_size).and_then(Vec::pop) {
            Some(bus) => bus,
            None => {
                let bus = window.next;
                let end = bus
                    .checked_add(aligned_size as u64)
                    .ok_or(DriverError::OutOfMemory)?;
                if end > window.limit {
                    return Err(DriverError::OutOfMemory);
                }
                window.next = end;
                bus
            }
        };

        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(virt) = NonNull::new(ptr) else {
            window.recycled.entry(aligned_size).or_default().push(bus);
            return Err(DriverError::OutOfMemory);
        };

        window.live.insert(
            bus,
            Mapping {
                virt: virt.as_ptr() as usize,
                size: aligned_size,
            },
        );

        self.allocated.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(aligned_size, Ordering::AcqRel);

        Ok(unsafe { DmaRegion::from_raw_parts(virt, PhysAddr::new(bus), aligned_size) })
    }

    fn release(&self, region: DmaRegion) {
        let bus = region.phys_addr().as_u64();
        let mut window = self.window.lock();

        let Some(mapping) = window.live.remove(&bus) else {
            error!("dma: release of unknown region {:#x}", bus);
            return;
        };

        if mapping.virt != region.virt_addr() as usize || mapping.size != region.size() {
            error!("dma: region {:#x} does not match its mapping", bus);
        }

        if let Ok(layout) = Self::layout(mapping.size) {
            unsafe { dealloc(mapping.virt as *mut u8, layout) };
        }
        window.recycled.entry(mapping.size).or_default().push(bus);

        self.released.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(mapping.size, Ordering::AcqRel);
    }
}

impl Drop for HostDmaAllocator {
    fn drop(&mut self) {
        let window = self.window.get_mut();
        if !window.live.is_empty() {
            warn!("dma: {} region(s) still live at allocator teardown", window.live.len());
        }
        for (_, mapping) in core::mem::take(&mut window.live) {
            if let Ok(layout) = Self::layout(mapping.size) {
                unsafe { dealloc(mapping.virt as *mut u8, layout) };
            }
        }
    }
}
