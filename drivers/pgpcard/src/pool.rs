//! DMA 缓冲区池
//!
//! 每个方向在 attach 时一次性分配固定数量、固定大小的缓冲区，detach 时逐个释放。
//! 池在分配之后不再变化，按总线地址查找缓冲区不需要加锁。

use std::collections::BTreeMap;

use derive_more::Display;
use libdriver::{DmaAllocator, DmaRegion, DriverError};
use log::{debug, error};
use pgpcard_protocol::FrameFlags;
use spin::Mutex;

use crate::error::{PgpError, PgpResult};

/// 传输方向
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[display("tx")]
    Tx,
    #[display("rx")]
    Rx,
}

/// 帧元数据
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub lane: u32,
    pub vc: u32,
    /// 字数
    pub length: u32,
    pub flags: FrameFlags,
}

/// DMA 缓冲区
pub struct Buffer {
    region: DmaRegion,
    /// 设备看到的 32 位总线地址
    dma_addr: u32,
    /// 可用字节数
    size: usize,
    meta: Mutex<FrameMeta>,
}

impl Buffer {
    #[inline]
    pub fn dma_addr(&self) -> u32 {
        self.dma_addr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn meta(&self) -> FrameMeta {
        *self.meta.lock()
    }

    pub fn set_meta(&self, meta: FrameMeta) {
        *self.meta.lock() = meta;
    }

    /// 负载前 `len` 字节
    ///
    /// # 安全性
    /// 调用者必须拥有该缓冲区（设备已归还且尚未重新提交）。
    pub unsafe fn payload(&self, len: usize) -> PgpResult<&[u8]> {
        self.check_len(len)?;
        Ok(unsafe { self.region.bytes(0, len) }?)
    }

    /// 可写的负载前 `len` 字节
    ///
    /// # 安全性
    /// 同 [`Buffer::payload`]，并且同一时间只能有一个可变引用。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut(&self, len: usize) -> PgpResult<&mut [u8]> {
        self.check_len(len)?;
        Ok(unsafe { self.region.bytes_mut(0, len) }?)
    }

    fn check_len(&self, len: usize) -> PgpResult<()> {
        if len > self.size {
            return Err(PgpError::Oversize {
                bytes: len,
                capacity: self.size,
            });
        }
        Ok(())
    }
}

/// 缓冲区池
pub struct BufferPool {
    direction: Direction,
    buffers: Vec<Buffer>,
    buffer_size: usize,
    /// 总线地址 -> 下标
    by_addr: BTreeMap<u32, usize>,
}

impl BufferPool {
    /// 分配 `count` 个 `size` 字节的缓冲区
    ///
    /// 任何一个分配失败时，已分配的缓冲区按相反顺序释放。
    pub fn allocate(
        direction: Direction,
        count: usize,
        size: usize,
        dma: &dyn DmaAllocator,
    ) -> PgpResult<Self> {
        let mut pool = Self {
            direction,
            buffers: Vec::with_capacity(count),
            buffer_size: size,
            by_addr: BTreeMap::new(),
        };

        for index in 0..count {
            if let Err(e) = pool.allocate_one(index, dma) {
                error!("pool: unable to allocate {} buffer {}: {}", direction, index, e);
                pool.release_all(dma);
                return Err(e);
            }
        }

        debug!(
            "pool: {} {} buffers of {:#x} bytes",
            count, direction, size
        );
        Ok(pool)
    }

    fn allocate_one(&mut self, index: usize, dma: &dyn DmaAllocator) -> PgpResult<()> {
        let region = dma.allocate(self.buffer_size)?;

        // 描述符只有 30 位地址字段，缓冲区必须 4 字节对齐且位于 32 位地址空间
        let dma_addr = match region.phys_addr().as_u32() {
            Some(addr) if addr & 0x3 == 0 => addr,
            _ => {
                error!(
                    "pool: {} buffer at {:#x} is not 32-bit addressable",
                    self.direction,
                    region.phys_addr().as_u64()
                );
                dma.release(region);
                return Err(PgpError::Driver(DriverError::InvalidArgument));
            }
        };

        self.by_addr.insert(dma_addr, index);
        self.buffers.push(Buffer {
            region,
            dma_addr,
            size: self.buffer_size,
            meta: Mutex::new(FrameMeta::default()),
        });
        Ok(())
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// 每个缓冲区的字节数
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// 按总线地址查找
    pub fn find(&self, dma_addr: u32) -> Option<usize> {
        self.by_addr.get(&dma_addr).copied()
    }

    #[inline]
    pub fn buffer(&self, index: usize) -> &Buffer {
        &self.buffers[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    /// 按相反顺序释放全部缓冲区，每个只释放一次
    pub fn release_all(&mut self, dma: &dyn DmaAllocator) {
        self.by_addr.clear();
        while let Some(buffer) = self.buffers.pop() {
            dma.release(buffer.region);
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            error!(
                "pool: {} {} buffer(s) dropped without release",
                self.buffers.len(),
                self.direction
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use libdriver::HostDmaAllocator;

    use super::*;

    #[test]
    fn buffers_are_distinct_and_findable() {
        let dma = HostDmaAllocator::new();
        let mut pool = BufferPool::allocate(Direction::Tx, 4, 8192, &dma).unwrap();

        assert_eq!(pool.len(), 4);
        for (index, buffer) in pool.iter().enumerate() {
            assert_eq!(buffer.dma_addr() & 3, 0);
            assert_eq!(pool.find(buffer.dma_addr()), Some(index));
        }
        assert_eq!(pool.find(0xDEAD_BEE0), None);

        pool.release_all(&dma);
        let stats = dma.stats();
        assert_eq!(stats.allocated, 4);
        assert_eq!(stats.released, 4);
    }

    #[test]
    fn partial_failure_releases_everything() {
        // 窗口只够 3 个缓冲区
        let dma = HostDmaAllocator::with_window(0x10_0000, 0x10_0000 + 3 * 8192);
        let result = BufferPool::allocate(Direction::Rx, 4, 8192, &dma);
        assert!(matches!(result, Err(PgpError::Driver(DriverError::OutOfMemory))));

        let stats = dma.stats();
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.released, 3);
    }

    #[test]
    fn addresses_above_4g_are_rejected() {
        let dma = HostDmaAllocator::with_window(0x1_0000_0000, 0x2_0000_0000);
        let result = BufferPool::allocate(Direction::Tx, 2, 4096, &dma);
        assert!(result.is_err());
        assert_eq!(dma.stats().live(), 0);
    }

    #[test]
    fn payload_is_bounded_by_buffer_size() {
        let dma = HostDmaAllocator::new();
        let mut pool = BufferPool::allocate(Direction::Tx, 1, 4096, &dma).unwrap();
        let buffer = pool.buffer(0);

        unsafe { buffer.payload_mut(4) }.unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(unsafe { buffer.payload(4) }.unwrap(), &[1, 2, 3, 4]);
        assert!(matches!(
            unsafe { buffer.payload(4097) },
            Err(PgpError::Oversize { .. })
        ));

        buffer.set_meta(FrameMeta {
            lane: 2,
            vc: 1,
            length: 1,
            flags: FrameFlags::EOFE,
        });
        assert_eq!(buffer.meta().lane, 2);

        pool.release_all(&dma);
    }
}
