use crate::{Exception, CLINT_BASE};


pub const CLINT_MTIMECMP: u64 = CLINT_BASE + 0x4000;
pub const CLINT_MTIME: u64 = CLINT_BASE + 0xbff8;


pub struct Clint {
    mtime: u64,
    mtimecmp: u64,
}


impl Clint {
    pub fn new() -> Self {
        Self {
            mtime: 0,
            mtimecmp: 0,
        }
    }


    pub fn load(&self, addr: u64, size: usize) -> Result<u64, Exception> {
        if size != 8 {
            return Err(Exception::LoadAccessFault);
        }

        Ok(match addr {
            CLINT_MTIMECMP => self.mtimecmp,
            CLINT_MTIME => self.mtime,
            _ => 0,
        })
    }


    pub fn store(&mut self, addr: u64, size: usize, value: u64) -> Result<(), Exception> {
        if size != 8 {
            return Err(Exception::StoreAccessFault);
        }

        match addr {
            CLINT_MTIMECMP => self.mtimecmp = value,
            CLINT_MTIME => self.mtime = value,
            _ => {}
        }

        Ok(())
    }
}
