use log::trace;

use crate::clint::Clint;
use crate::mem::Dram;
use crate::plic::Plic;
use crate::uart::Uart;
use crate::virtio::{Virtio, DESC_NUM, SECTOR_SIZE};
use crate::{
    Exception, CLINT_BASE, CLINT_SIZE, DRAM_BASE, DRAM_SIZE, PLIC_BASE, PLIC_SIZE, UART_BASE,
    UART_SIZE, VIRTIO_BASE, VIRTIO_SIZE,
};


pub struct Bus {
    pub clint: Clint,
    pub plic: Plic,
    pub uart: Uart,
    pub virtio: Virtio,
    pub dram: Dram,
}


impl Bus {
    pub fn new(code: &[u8], disk: Vec<u8>) -> Self {
        Self {
            clint: Clint::new(),
            plic: Plic::new(),
            uart: Uart::new(),
            virtio: Virtio::new(disk),
            dram: Dram::new(code),
        }
    }


    pub fn load(&mut self, addr: u64, size: usize) -> Result<u64, Exception> {
        if addr >= CLINT_BASE && addr < CLINT_BASE + CLINT_SIZE {
            return self.clint.load(addr, size);
        }

        if addr >= PLIC_BASE && addr < PLIC_BASE + PLIC_SIZE {
            return self.plic.load(addr, size);
        }

        if addr >= UART_BASE && addr < UART_BASE + UART_SIZE {
            return self.uart.load(addr, size);
        }

        if addr >= VIRTIO_BASE && addr < VIRTIO_BASE + VIRTIO_SIZE {
            return self.virtio.load(addr, size);
        }

        if addr >= DRAM_BASE && addr < DRAM_BASE + DRAM_SIZE {
            // the tail of the access has to stay inside the region
            if !matches!(size, 1 | 2 | 4 | 8) || addr + size as u64 > DRAM_BASE + DRAM_SIZE {
                return Err(Exception::LoadAccessFault);
            }
            return Ok(self.dram.load(addr, size));
        }

        Err(Exception::LoadAccessFault)
    }


    pub fn store(&mut self, addr: u64, size: usize, value: u64) -> Result<(), Exception> {
        if addr >= CLINT_BASE && addr < CLINT_BASE + CLINT_SIZE {
            return self.clint.store(addr, size, value);
        }

        if addr >= PLIC_BASE && addr < PLIC_BASE + PLIC_SIZE {
            return self.plic.store(addr, size, value);
        }

        if addr >= UART_BASE && addr < UART_BASE + UART_SIZE {
            return self.uart.store(addr, size, value);
        }

        if addr >= VIRTIO_BASE && addr < VIRTIO_BASE + VIRTIO_SIZE {
            return self.virtio.store(addr, size, value);
        }

        if addr >= DRAM_BASE && addr < DRAM_BASE + DRAM_SIZE {
            // the tail of the access has to stay inside the region
            if !matches!(size, 1 | 2 | 4 | 8) || addr + size as u64 > DRAM_BASE + DRAM_SIZE {
                return Err(Exception::StoreAccessFault);
            }
            self.dram.store(addr, size, value);
            return Ok(());
        }

        Err(Exception::StoreAccessFault)
    }


    // walk the virtqueue the guest appended to and move one request's
    // worth of bytes between guest memory and the backing disk
    pub fn disk_access(&mut self) {
        let desc = self.virtio.desc_addr();
        let avail = desc.wrapping_add(0x40);
        let used = desc.wrapping_add(4096);

        // the ring offset lives one byte in, matching the guest layout
        let offset = self
            .load(avail.wrapping_add(1), 2)
            .expect("virtq avail: ring offset");
        let index = self
            .load(avail.wrapping_add(offset % DESC_NUM).wrapping_add(2), 2)
            .expect("virtq avail: ring index");

        // head descriptor holds the request header address
        let d0 = desc.wrapping_add(16 * index);
        let addr0 = self.load(d0, 8).expect("virtq desc0: addr");
        let next0 = self.load(d0.wrapping_add(14), 2).expect("virtq desc0: next");

        // second descriptor holds the data buffer
        let d1 = desc.wrapping_add(16 * next0);
        let addr1 = self.load(d1, 8).expect("virtq desc1: addr");
        let len1 = self.load(d1.wrapping_add(8), 4).expect("virtq desc1: len");
        let flags1 = self
            .load(d1.wrapping_add(12), 2)
            .expect("virtq desc1: flags");

        let sector = self
            .load(addr0.wrapping_add(8), 8)
            .expect("virtq request: sector");

        trace!(
            "virtio: {} sector {sector}, {len1} bytes",
            if flags1 & 0x2 == 0 { "write" } else { "read" }
        );

        if flags1 & 0x2 == 0 {
            // guest buffer to disk
            for i in 0..len1 {
                let b = self
                    .load(addr1.wrapping_add(i), 1)
                    .expect("virtq dma: guest buffer read");
                self.virtio.write_disk(sector * SECTOR_SIZE + i, b as u8);
            }
        } else {
            // disk to guest buffer
            for i in 0..len1 {
                let b = self.virtio.read_disk(sector * SECTOR_SIZE + i);
                self.store(addr1.wrapping_add(i), 1, b as u64)
                    .expect("virtq dma: guest buffer write");
            }
        }

        let id = self.virtio.new_id() % DESC_NUM;
        self.store(used.wrapping_add(2), 2, id)
            .expect("virtq used: ring index");
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::{VIRTIO_GUEST_PAGE_SIZE, VIRTIO_QUEUE_PFN};
    use crate::PAGE_SIZE;

    #[test]
    fn routes_to_dram() {
        let mut bus = Bus::new(&[], vec![]);
        bus.store(DRAM_BASE + 0x100, 8, 0xfeed_face).unwrap();
        assert_eq!(bus.load(DRAM_BASE + 0x100, 8).unwrap(), 0xfeed_face);
    }

    #[test]
    fn routes_to_devices() {
        let mut bus = Bus::new(&[], vec![]);
        bus.store(crate::clint::CLINT_MTIME, 8, 7).unwrap();
        bus.store(crate::plic::PLIC_SENABLE, 4, 3).unwrap();
        assert_eq!(bus.load(crate::clint::CLINT_MTIME, 8).unwrap(), 7);
        assert_eq!(bus.load(crate::plic::PLIC_SENABLE, 4).unwrap(), 3);
        assert_eq!(bus.load(crate::virtio::VIRTIO_MAGIC, 4).unwrap(), 0x7472_6976);
    }

    #[test]
    fn unmapped_address_faults() {
        let mut bus = Bus::new(&[], vec![]);
        assert_eq!(bus.load(0x0, 8), Err(Exception::LoadAccessFault));
        assert_eq!(bus.load(0x4000_0000, 4), Err(Exception::LoadAccessFault));
        assert_eq!(bus.store(0x0, 8, 0), Err(Exception::StoreAccessFault));
        assert_eq!(
            bus.load(DRAM_BASE + DRAM_SIZE, 8),
            Err(Exception::LoadAccessFault)
        );
    }

    #[test]
    fn wide_access_at_top_of_dram_faults() {
        let mut bus = Bus::new(&[], vec![]);
        let top = DRAM_BASE + DRAM_SIZE;

        bus.store(top - 8, 8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(bus.load(top - 8, 8).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(bus.load(top - 1, 1).unwrap(), 0x01);

        assert_eq!(bus.load(top - 1, 8), Err(Exception::LoadAccessFault));
        assert_eq!(bus.load(top - 4, 8), Err(Exception::LoadAccessFault));
        assert_eq!(bus.load(top - 1, 2), Err(Exception::LoadAccessFault));
        assert_eq!(bus.store(top - 1, 8, 0), Err(Exception::StoreAccessFault));
        assert_eq!(bus.store(top - 3, 4, 0), Err(Exception::StoreAccessFault));
    }

    // lay out one 2-descriptor block request at `desc` and return
    // (request header, data buffer, used ring) addresses
    fn queue_request(bus: &mut Bus, desc: u64, len: u64, flags: u64) -> (u64, u64, u64) {
        let avail = desc + 0x40;
        let used = desc + 4096;
        let header = desc + 0x2000;
        let buffer = desc + 0x3000;

        bus.store(VIRTIO_GUEST_PAGE_SIZE, 4, PAGE_SIZE).unwrap();
        bus.store(VIRTIO_QUEUE_PFN, 4, desc / PAGE_SIZE).unwrap();

        // ring offset 0, ring[0] = descriptor 0
        bus.store(avail + 1, 2, 0).unwrap();
        bus.store(avail + 2, 2, 0).unwrap();

        // descriptor 0: request header, chained to descriptor 1
        bus.store(desc, 8, header).unwrap();
        bus.store(desc + 14, 2, 1).unwrap();

        // descriptor 1: data buffer
        bus.store(desc + 16, 8, buffer).unwrap();
        bus.store(desc + 16 + 8, 4, len).unwrap();
        bus.store(desc + 16 + 12, 2, flags).unwrap();

        // sector 0
        bus.store(header + 8, 8, 0).unwrap();

        (header, buffer, used)
    }

    #[test]
    fn disk_access_reads_sector_into_guest_memory() {
        let mut disk = vec![0; SECTOR_SIZE as usize];
        for (i, b) in disk.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut bus = Bus::new(&[], disk);

        let (_, buffer, used) = queue_request(&mut bus, DRAM_BASE + 0x8000, 16, 0x2);
        bus.disk_access();

        for i in 0..16 {
            assert_eq!(bus.load(buffer + i, 1).unwrap(), i);
        }
        assert_eq!(bus.load(used + 2, 2).unwrap(), 1);
    }

    #[test]
    fn disk_access_writes_guest_memory_to_disk() {
        let mut bus = Bus::new(&[], vec![0; SECTOR_SIZE as usize]);

        let (_, buffer, _) = queue_request(&mut bus, DRAM_BASE + 0x8000, 8, 0x0);
        for i in 0..8 {
            bus.store(buffer + i, 1, 0xa0 + i).unwrap();
        }
        bus.disk_access();

        for i in 0..8 {
            assert_eq!(bus.virtio.read_disk(i), 0xa0 + i as u8);
        }
    }
}
