//! MMIO 寄存器访问

use core::ptr::{read_volatile, write_volatile, NonNull};

use crate::{DriverError, PhysAddr, Result};

/// 32 位寄存器总线
///
/// 设备寄存器窗口的访问接口。每次读写都直接到达硬件，不做任何缓存。
/// 真实设备由 [`MmioRegion`] 实现，测试中由模拟设备实现。
pub trait RegisterBus: Send + Sync {
    /// 读取 32 位寄存器
    fn read_u32(&self, offset: usize) -> u32;

    /// 写入 32 位寄存器
    fn write_u32(&self, offset: usize, value: u32);

    /// 设置位
    fn set_bits_u32(&self, offset: usize, bits: u32) {
        let val = self.read_u32(offset);
        self.write_u32(offset, val | bits);
    }

    /// 清除位
    fn clear_bits_u32(&self, offset: usize, bits: u32) {
        let val = self.read_u32(offset);
        self.write_u32(offset, val & !bits);
    }
}

/// MMIO 区域
///
/// 已映射到进程地址空间的设备寄存器窗口（例如 PCI BAR 的 `resource0` 映射）。
pub struct MmioRegion {
    /// 虚拟地址
    base: NonNull<u8>,
    /// 大小
    size: usize,
    /// 物理地址
    phys_addr: PhysAddr,
}

impl MmioRegion {
    /// 从已映射的窗口创建
    ///
    /// # 安全性
    /// `base` 必须指向至少 `size` 字节的设备寄存器映射，并在 `MmioRegion` 存活期间保持有效。
    pub unsafe fn from_raw(base: *mut u8, size: usize, phys_addr: PhysAddr) -> Result<Self> {
        if size == 0 {
            return Err(DriverError::InvalidArgument);
        }

        let base = NonNull::new(base).ok_or(DriverError::InvalidArgument)?;

        Ok(Self {
            base,
            size,
            phys_addr,
        })
    }

    /// 获取基地址
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// 获取大小
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// 获取物理地址
    #[inline]
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys_addr
    }

    /// 读取寄存器
    #[inline]
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        assert!(offset + core::mem::size_of::<T>() <= self.size);
        unsafe { read_volatile(self.base.as_ptr().add(offset) as *const T) }
    }

    /// 写入寄存器
    #[inline]
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        assert!(offset + core::mem::size_of::<T>() <= self.size);
        unsafe { write_volatile(self.base.as_ptr().add(offset) as *mut T, value) }
    }
}

impl RegisterBus for MmioRegion {
    #[inline]
    fn read_u32(&self, offset: usize) -> u32 {
        self.read(offset)
    }

    #[inline]
    fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, value)
    }
}

unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

/// 寄存器引用
#[derive(Clone, Copy)]
pub struct Register<'a> {
    bus: &'a dyn RegisterBus,
    offset: usize,
}

impl<'a> Register<'a> {
    pub fn new(bus: &'a dyn RegisterBus, offset: usize) -> Self {
        Self { bus, offset }
    }

    /// 寄存器偏移
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// 读取
    #[inline]
    pub fn read(&self) -> u32 {
        self.bus.read_u32(self.offset)
    }

    /// 写入
    #[inline]
    pub fn write(&self, value: u32) {
        self.bus.write_u32(self.offset, value)
    }

    /// 修改
    #[inline]
    pub fn modify(&self, f: impl FnOnce(u32) -> u32) {
        let val = self.read();
        self.write(f(val));
    }

    /// 设置位
    #[inline]
    pub fn set_bits(&self, bits: u32) {
        self.bus.set_bits_u32(self.offset, bits)
    }

    /// 清除位
    #[inline]
    pub fn clear_bits(&self, bits: u32) {
        self.bus.clear_bits_u32(self.offset, bits)
    }
}

/// 定义寄存器块
///
/// 每个条目是 `名称 where 偏移`，或寄存器数组 `名称[个数] where 起始偏移`（步长 4 字节）。
#[macro_export]
macro_rules! define_regs {
    (@accessor $(#[$attr:meta])* $reg_name:ident [$count:expr] where $offset:expr) => {
        $(#[$attr])*
        #[inline]
        pub fn $reg_name(&self, index: usize) -> $crate::mmio::Register<'_> {
            debug_assert!(index < $count);
            $crate::mmio::Register::new(&*self.bus, $offset + index * 4)
        }
    };
    (@accessor $(#[$attr:meta])* $reg_name:ident where $offset:expr) => {
        $(#[$attr])*
        #[inline]
        pub fn $reg_name(&self) -> $crate::mmio::Register<'_> {
            $crate::mmio::Register::new(&*self.bus, $offset)
        }
    };
    (
        $vis:vis struct $name:ident {
            $(
                $(#[$attr:meta])*
                $reg_name:ident $([$count:expr])? where $offset:expr
            ),* $(,)?
        }
    ) => {
        $vis struct $name {
            bus: ::std::sync::Arc<dyn $crate::mmio::RegisterBus>,
        }

        impl $name {
            pub fn new(bus: ::std::sync::Arc<dyn $crate::mmio::RegisterBus>) -> Self {
                Self { bus }
            }

            /// 底层寄存器总线
            pub fn bus(&self) -> &dyn $crate::mmio::RegisterBus {
                &*self.bus
            }

            /// 底层寄存器总线的共享句柄
            pub fn shared_bus(&self) -> ::std::sync::Arc<dyn $crate::mmio::RegisterBus> {
                self.bus.clone()
            }

            $(
                $crate::define_regs!(@accessor $(#[$attr])* $reg_name $([$count])? where $offset);
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use spin::Mutex;

    use super::*;

    struct ArrayBus {
        words: Mutex<[u32; 16]>,
    }

    impl RegisterBus for ArrayBus {
        fn read_u32(&self, offset: usize) -> u32 {
            self.words.lock()[offset / 4]
        }

        fn write_u32(&self, offset: usize, value: u32) {
            self.words.lock()[offset / 4] = value;
        }
    }

    define_regs! {
        struct TestRegs {
            /// 控制
            ctrl where 0x00,
            status where 0x04,
            lanes[4] where 0x10,
        }
    }

    #[test]
    fn scalar_and_indexed_registers() {
        let bus = Arc::new(ArrayBus {
            words: Mutex::new([0; 16]),
        });
        let regs = TestRegs::new(bus.clone());

        regs.ctrl().write(0xA5);
        regs.lanes(2).write(7);
        regs.status().set_bits(0b110);
        regs.status().clear_bits(0b010);

        let words = bus.words.lock();
        assert_eq!(words[0], 0xA5);
        assert_eq!(words[1], 0b100);
        assert_eq!(words[4 + 2], 7);
        assert_eq!(regs.lanes(2).offset(), 0x18);
    }

    #[test]
    fn modify_reads_live_value() {
        let bus = Arc::new(ArrayBus {
            words: Mutex::new([0; 16]),
        });
        let regs = TestRegs::new(bus.clone());

        bus.words.lock()[0] = 0xF0;
        regs.ctrl().modify(|v| v | 0x0F);
        assert_eq!(regs.ctrl().read(), 0xFF);
    }

    #[test]
    fn mmio_region_over_plain_memory() {
        let mut backing = [0u32; 4];
        let region = unsafe {
            MmioRegion::from_raw(backing.as_mut_ptr() as *mut u8, 16, PhysAddr::new(0xF000_0000))
        }
        .unwrap();

        region.write_u32(4, 0x1234_5678);
        region.set_bits_u32(8, 0x3);
        assert_eq!(region.read_u32(4), 0x1234_5678);
        assert_eq!(region.read_u32(8), 0x3);
        assert_eq!(region.phys_addr(), PhysAddr::new(0xF000_0000));

        assert!(unsafe { MmioRegion::from_raw(core::ptr::null_mut(), 16, PhysAddr::NULL) }.is_err());
    }
}
