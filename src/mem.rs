use bytes::{Buf, BufMut};

use crate::{DRAM_BASE, DRAM_SIZE};


pub struct Dram {
    mem: Vec<u8>,
}


impl Dram {
    pub fn new(code: &[u8]) -> Self {
        let mut mem = vec![0; DRAM_SIZE as usize];
        mem[..code.len()].copy_from_slice(code);
        Self { mem }
    }


    // callers are gated by the bus decode, so the whole access sits inside
    // [DRAM_BASE, DRAM_BASE + DRAM_SIZE)
    pub fn load(&self, addr: u64, size: usize) -> u64 {
        let at = (addr - DRAM_BASE) as usize;
        (&self.mem[at..]).get_uint_le(size)
    }


    pub fn store(&mut self, addr: u64, size: usize, value: u64) {
        let at = (addr - DRAM_BASE) as usize;
        (&mut self.mem[at..]).put_uint_le(value, size);
    }
}
