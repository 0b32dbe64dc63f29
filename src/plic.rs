use crate::{Exception, PLIC_BASE};


pub const PLIC_PENDING: u64 = PLIC_BASE + 0x1000;
pub const PLIC_SENABLE: u64 = PLIC_BASE + 0x2000;
pub const PLIC_SPRIORITY: u64 = PLIC_BASE + 0x20_1000;
pub const PLIC_SCLAIM: u64 = PLIC_BASE + 0x20_1004;


pub struct Plic {
    pending: u64,
    senable: u64,
    spriority: u64,
    sclaim: u64,
}


impl Plic {
    pub fn new() -> Self {
        Self {
            pending: 0,
            senable: 0,
            spriority: 0,
            sclaim: 0,
        }
    }


    pub fn load(&self, addr: u64, size: usize) -> Result<u64, Exception> {
        if size != 4 {
            return Err(Exception::LoadAccessFault);
        }

        Ok(match addr {
            PLIC_PENDING => self.pending,
            PLIC_SENABLE => self.senable,
            PLIC_SPRIORITY => self.spriority,
            PLIC_SCLAIM => self.sclaim,
            _ => 0,
        })
    }


    pub fn store(&mut self, addr: u64, size: usize, value: u64) -> Result<(), Exception> {
        if size != 4 {
            return Err(Exception::StoreAccessFault);
        }

        match addr {
            PLIC_PENDING => self.pending = value,
            PLIC_SENABLE => self.senable = value,
            PLIC_SPRIORITY => self.spriority = value,
            PLIC_SCLAIM => self.sclaim = value,
            _ => {}
        }

        Ok(())
    }
}
