//! 设备注册表
//!
//! 按槽位保存已 attach 的板卡，槽位数由配置决定。probe 把 PCI 设备 attach 到最小的空闲槽位，
//! detach 按相反顺序撤销。注册表析构时分离全部设备。

use std::sync::Arc;

use log::{info, warn};
use pci_types::PciAddress;
use spin::RwLock;

use crate::config::PgpCardConfig;
use crate::device::{DeviceResources, PgpCard};
use crate::error::{PgpError, PgpResult};
use crate::transfer::{OpenFlags, Session};
use crate::{MOD_NAME, PCI_DEVICE_ID_PGPCARD, PCI_VENDOR_ID_SLAC};

fn format_address(address: PciAddress) -> String {
    format!(
        "{:02x}:{:02x}.{}",
        address.bus(),
        address.device(),
        address.function()
    )
}

/// 设备注册表
pub struct DeviceRegistry {
    config: PgpCardConfig,
    slots: RwLock<Vec<Option<Arc<PgpCard>>>>,
}

impl DeviceRegistry {
    pub fn new(config: PgpCardConfig) -> PgpResult<Self> {
        config.validate()?;
        let slots = (0..config.max_devices).map(|_| None).collect();
        Ok(Self {
            config,
            slots: RwLock::new(slots),
        })
    }

    pub fn config(&self) -> &PgpCardConfig {
        &self.config
    }

    /// probe 一个 PCI 设备，成功时返回槽位
    pub fn probe(&self, resources: DeviceResources) -> PgpResult<usize> {
        let address = resources.address;

        if resources.vendor_id != PCI_VENDOR_ID_SLAC || resources.device_id != PCI_DEVICE_ID_PGPCARD {
            return Err(PgpError::NotSupported(format!(
                "{:04x}:{:04x} at {}",
                resources.vendor_id,
                resources.device_id,
                format_address(address)
            )));
        }

        let mut slots = self.slots.write();

        if slots.iter().flatten().any(|card| card.address() == address) {
            warn!(
                "{}: Probe: device {} is already attached",
                MOD_NAME,
                format_address(address)
            );
            return Err(PgpError::Busy);
        }

        let Some(slot) = slots.iter().position(Option::is_none) else {
            warn!("{}: Probe: Too Many Devices.", MOD_NAME);
            return Err(PgpError::RegistryFull);
        };

        let name = format!("{}_{}", MOD_NAME, slot);
        let card = PgpCard::attach(name, slot, resources, &self.config)?;
        info!(
            "{}: Probe: attached {} at {}",
            MOD_NAME,
            card.name(),
            format_address(address)
        );
        slots[slot] = Some(card);

        Ok(slot)
    }

    pub fn get(&self, slot: usize) -> Option<Arc<PgpCard>> {
        self.slots.read().get(slot).cloned().flatten()
    }

    /// 按 PCI 地址查找
    pub fn find(&self, address: PciAddress) -> Option<Arc<PgpCard>> {
        self.slots
            .read()
            .iter()
            .flatten()
            .find(|card| card.address() == address)
            .cloned()
    }

    /// 打开槽位上的设备
    pub fn open(&self, slot: usize, flags: OpenFlags) -> PgpResult<Session> {
        self.get(slot).ok_or(PgpError::NoDevice)?.open(flags)
    }

    /// 分离槽位上的设备
    ///
    /// 设备仍被打开或仍有其他句柄时返回 [`PgpError::Busy`]。
    pub fn detach(&self, slot: usize) -> PgpResult<()> {
        let mut slots = self.slots.write();
        let entry = slots.get_mut(slot).ok_or(PgpError::NoDevice)?;
        let card = entry.as_ref().ok_or(PgpError::NoDevice)?;

        if card.is_open() || Arc::strong_count(card) > 1 {
            warn!("{}: Remove: {} is still in use", MOD_NAME, card.name());
            return Err(PgpError::Busy);
        }

        if let Some(card) = entry.take() {
            card.detach();
            info!("{}: Remove: {} removed", MOD_NAME, card.name());
        }
        Ok(())
    }

    /// 按槽位顺序分离全部设备，不检查句柄
    pub fn detach_all(&self) {
        let cards: Vec<Arc<PgpCard>> = self.slots.write().iter_mut().filter_map(Option::take).collect();
        for card in cards {
            card.detach();
            info!("{}: Remove: {} removed", MOD_NAME, card.name());
        }
    }

    /// 已 attach 的设备数
    pub fn len(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.detach_all();
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::SimCard;

    use super::*;

    fn small_config(max_devices: usize) -> PgpCardConfig {
        PgpCardConfig::default()
            .with_tx_buffers(4, 4096)
            .with_rx_buffers(4, 4096)
            .with_max_devices(max_devices)
    }

    #[test]
    fn probe_assigns_slots_and_names() {
        let registry = DeviceRegistry::new(small_config(4)).unwrap();
        let a = SimCard::at(PciAddress::new(0, 3, 0, 0));
        let b = SimCard::at(PciAddress::new(0, 4, 0, 0));

        assert_eq!(registry.probe(a.resources()).unwrap(), 0);
        assert_eq!(registry.probe(b.resources()).unwrap(), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().name(), "PgpCardG3_1");
        assert_eq!(
            registry.find(PciAddress::new(0, 3, 0, 0)).unwrap().slot(),
            0
        );
        assert!(registry.get(2).is_none());
    }

    #[test]
    fn probe_rejects_foreign_duplicate_and_overflow() {
        let registry = DeviceRegistry::new(small_config(1)).unwrap();

        let foreign = SimCard::at(PciAddress::new(0, 5, 0, 0));
        let mut resources = foreign.resources();
        resources.device_id = 0x1234;
        assert!(matches!(registry.probe(resources), Err(PgpError::NotSupported(_))));

        let a = SimCard::at(PciAddress::new(0, 3, 0, 0));
        registry.probe(a.resources()).unwrap();
        assert_eq!(registry.probe(a.resources()), Err(PgpError::Busy));

        let b = SimCard::at(PciAddress::new(0, 4, 0, 0));
        assert_eq!(registry.probe(b.resources()), Err(PgpError::RegistryFull));
        // 失败的 probe 没有分配任何缓冲区
        assert_eq!(b.dma().stats().allocated, 0);
    }

    #[test]
    fn detach_refuses_devices_in_use() {
        let registry = DeviceRegistry::new(small_config(2)).unwrap();
        let sim = SimCard::at(PciAddress::new(0, 3, 0, 0));
        let slot = registry.probe(sim.resources()).unwrap();

        let session = registry.open(slot, OpenFlags::empty()).unwrap();
        assert_eq!(registry.detach(slot), Err(PgpError::Busy));
        drop(session);

        let handle = registry.get(slot).unwrap();
        assert_eq!(registry.detach(slot), Err(PgpError::Busy));
        drop(handle);

        registry.detach(slot).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.detach(slot), Err(PgpError::NoDevice));
        assert!(matches!(registry.open(slot, OpenFlags::empty()), Err(PgpError::NoDevice)));

        // 缓冲区全部释放，卡回到复位状态
        let stats = sim.dma().stats();
        assert_eq!(stats.allocated, 8);
        assert_eq!(stats.released, 8);
        assert_eq!(sim.peek(crate::regs::offsets::CARD_RST_STAT) & 0x2, 0x2);
        assert_eq!(sim.peek(crate::regs::offsets::RX_MAX_FRAME), 0);
    }

    #[test]
    fn dropping_the_registry_releases_everything() {
        let a = SimCard::at(PciAddress::new(0, 3, 0, 0));
        let b = SimCard::at(PciAddress::new(0, 4, 0, 0));
        {
            let registry = DeviceRegistry::new(small_config(2)).unwrap();
            registry.probe(a.resources()).unwrap();
            registry.probe(b.resources()).unwrap();
        }
        for sim in [a, b] {
            let stats = sim.dma().stats();
            assert_eq!(stats.allocated, stats.released);
            assert_eq!(stats.live_bytes, 0);
        }
    }
}
