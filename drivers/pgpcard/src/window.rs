//! 寄存器窗口映射
//!
//! 把 BAR0 寄存器窗口直接交给调用者，绕过控制命令访问任意寄存器。

use std::sync::Arc;

use libdriver::{DriverError, RegisterBus};
use log::warn;

use crate::device::Shared;
use crate::error::{PgpError, PgpResult};

bitflags::bitflags! {
    /// 映射权限
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WindowAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// 映射出的寄存器窗口
#[derive(Clone)]
pub struct RegisterWindow {
    bus: Arc<dyn RegisterBus>,
    phys_addr: u64,
    len: usize,
    access: WindowAccess,
}

impl RegisterWindow {
    /// 映射窗口的前 `len` 字节，`len` 不能超过 BAR0 长度
    pub(crate) fn map(shared: &Shared, len: usize, access: WindowAccess) -> PgpResult<Self> {
        if shared.is_detached() {
            return Err(PgpError::NoDevice);
        }

        let base_len = shared.identity.base_len;
        if len == 0 || len > base_len {
            warn!(
                "{}: Mmap: requested {} bytes, BAR0 is {} bytes",
                shared.name, len, base_len
            );
            return Err(PgpError::Driver(DriverError::InvalidArgument));
        }

        Ok(Self {
            bus: shared.regs.shared_bus(),
            phys_addr: shared.identity.base_hdwr,
            len,
            access,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 窗口的物理地址
    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    pub fn access(&self) -> WindowAccess {
        self.access
    }

    pub fn read_u32(&self, offset: usize) -> PgpResult<u32> {
        self.check(offset, WindowAccess::READ)?;
        Ok(self.bus.read_u32(offset))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> PgpResult<()> {
        self.check(offset, WindowAccess::WRITE)?;
        self.bus.write_u32(offset, value);
        Ok(())
    }

    fn check(&self, offset: usize, needed: WindowAccess) -> PgpResult<()> {
        let in_range = offset % 4 == 0 && offset.checked_add(4).is_some_and(|end| end <= self.len);
        if !in_range || !self.access.contains(needed) {
            return Err(PgpError::Fault(self.phys_addr + offset as u64));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::regs::offsets;
    use crate::sim::{SimCard, SIM_BAR_BASE, SIM_VERSION};
    use crate::transfer::OpenFlags;

    use super::*;

    #[test]
    fn read_only_window_rejects_writes() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);
        let session = card.open(OpenFlags::empty()).unwrap();

        let window = session
            .map_registers(offsets::REGION_SIZE, WindowAccess::READ)
            .unwrap();
        assert_eq!(window.phys_addr(), SIM_BAR_BASE);
        assert_eq!(window.read_u32(offsets::VERSION).unwrap(), SIM_VERSION);

        let writes = sim.write_count();
        assert_eq!(
            window.write_u32(offsets::SCRATCH, 1),
            Err(PgpError::Fault(SIM_BAR_BASE + offsets::SCRATCH as u64))
        );
        assert_eq!(sim.write_count(), writes);
    }

    #[test]
    fn writable_window_reaches_the_card() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);
        let session = card.open(OpenFlags::empty()).unwrap();

        let window = session
            .map_registers(0x100, WindowAccess::READ | WindowAccess::WRITE)
            .unwrap();
        window.write_u32(offsets::SCRATCH, 0x1234_5678).unwrap();
        assert_eq!(sim.peek(offsets::SCRATCH), 0x1234_5678);

        // 越界或未对齐
        assert!(matches!(window.read_u32(0x100), Err(PgpError::Fault(_))));
        assert!(matches!(window.read_u32(0x0E), Err(PgpError::Fault(_))));
    }

    #[test]
    fn window_larger_than_bar_is_refused() {
        let sim = SimCard::new();
        let card = sim.attach_small(4, 4096);
        let session = card.open(OpenFlags::empty()).unwrap();

        assert_eq!(
            session
                .map_registers(offsets::REGION_SIZE + 4, WindowAccess::READ)
                .err(),
            Some(PgpError::Driver(DriverError::InvalidArgument))
        );

        card.detach();
        assert_eq!(
            session.map_registers(0x100, WindowAccess::READ).err(),
            Some(PgpError::NoDevice)
        );
    }
}
