#![forbid(unused_must_use)]
pub mod bus;
pub mod clint;
pub mod instrs;
pub mod mem;
pub mod plic;
pub mod uart;
pub mod virtio;

use log::{debug, warn};

use crate::bus::Bus;
use crate::instrs::Instr;
use crate::plic::PLIC_SCLAIM;


pub const CLINT_BASE: u64 = 0x0200_0000;
pub const CLINT_SIZE: u64 = 0x1_0000;
pub const PLIC_BASE: u64 = 0x0c00_0000;
pub const PLIC_SIZE: u64 = 0x0400_0000;
pub const UART_BASE: u64 = 0x1000_0000;
pub const UART_SIZE: u64 = 0x100;
pub const VIRTIO_BASE: u64 = 0x1000_1000;
pub const VIRTIO_SIZE: u64 = 0x1000;
pub const DRAM_BASE: u64 = 0x8000_0000;
pub const DRAM_SIZE: u64 = 128 * 1024 * 1024;

pub const PAGE_SIZE: u64 = 4096;

pub const UART_IRQ: u64 = 10;
pub const VIRTIO_IRQ: u64 = 1;


pub const CSR_SSTATUS: usize = 0x100;
pub const CSR_SIE: usize = 0x104;
pub const CSR_STVEC: usize = 0x105;
pub const CSR_SEPC: usize = 0x141;
pub const CSR_SCAUSE: usize = 0x142;
pub const CSR_STVAL: usize = 0x143;
pub const CSR_SIP: usize = 0x144;
pub const CSR_SATP: usize = 0x180;

pub const CSR_MSTATUS: usize = 0x300;
pub const CSR_MEDELEG: usize = 0x302;
pub const CSR_MIDELEG: usize = 0x303;
pub const CSR_MIE: usize = 0x304;
pub const CSR_MTVEC: usize = 0x305;
pub const CSR_MEPC: usize = 0x341;
pub const CSR_MCAUSE: usize = 0x342;
pub const CSR_MTVAL: usize = 0x343;
pub const CSR_MIP: usize = 0x344;


pub const MIP_SSIP: u64 = 1 << 1;
pub const MIP_MSIP: u64 = 1 << 3;
pub const MIP_STIP: u64 = 1 << 5;
pub const MIP_MTIP: u64 = 1 << 7;
pub const MIP_SEIP: u64 = 1 << 9;
pub const MIP_MEIP: u64 = 1 << 11;


pub const ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2",
    "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7",
    "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];


#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Priv {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}


#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Exception {
    InstrAddrMisaligned,
    InstrAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadAddrMisaligned,
    LoadAccessFault,
    StoreAddrMisaligned,
    StoreAccessFault,
    EcallUmode,
    EcallSmode,
    EcallMmode,
    InstrPageFault,
    LoadPageFault,
    StorePageFault,
}


impl Exception {
    pub fn code(self) -> u64 {
        match self {
            Exception::InstrAddrMisaligned => 0,
            Exception::InstrAccessFault => 1,
            Exception::IllegalInstruction => 2,
            Exception::Breakpoint => 3,
            Exception::LoadAddrMisaligned => 4,
            Exception::LoadAccessFault => 5,
            Exception::StoreAddrMisaligned => 6,
            Exception::StoreAccessFault => 7,
            Exception::EcallUmode => 8,
            Exception::EcallSmode => 9,
            Exception::EcallMmode => 11,
            Exception::InstrPageFault => 12,
            Exception::LoadPageFault => 13,
            Exception::StorePageFault => 15,
        }
    }


    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Exception::InstrAddrMisaligned
                | Exception::InstrAccessFault
                | Exception::LoadAddrMisaligned
                | Exception::LoadAccessFault
                | Exception::StoreAddrMisaligned
                | Exception::StoreAccessFault
        )
    }
}


#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Interrupt {
    UserSoftware,
    SupervisorSoftware,
    MachineSoftware,
    UserTimer,
    SupervisorTimer,
    MachineTimer,
    UserExternal,
    SupervisorExternal,
    MachineExternal,
}


impl Interrupt {
    pub fn code(self) -> u64 {
        match self {
            Interrupt::UserSoftware => 0,
            Interrupt::SupervisorSoftware => 1,
            Interrupt::MachineSoftware => 3,
            Interrupt::UserTimer => 4,
            Interrupt::SupervisorTimer => 5,
            Interrupt::MachineTimer => 7,
            Interrupt::UserExternal => 8,
            Interrupt::SupervisorExternal => 9,
            Interrupt::MachineExternal => 11,
        }
    }
}


#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Trap {
    Exception(Exception),
    Interrupt(Interrupt),
}


#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum AccessType {
    Fetch,
    Load,
    Store,
}


impl AccessType {
    fn fault(self) -> Exception {
        match self {
            AccessType::Fetch => Exception::InstrPageFault,
            AccessType::Load => Exception::LoadPageFault,
            AccessType::Store => Exception::StorePageFault,
        }
    }
}


pub struct Regs {
    regs: [u64; 32],
}


impl Regs {
    pub fn new() -> Self {
        Self { regs: [0; 32] }
    }


    #[inline(always)]
    pub fn read(&self, idx: usize) -> u64 {
        self.regs[idx]
    }


    // x0 is hardwired to zero
    #[inline(always)]
    pub fn write(&mut self, idx: usize, data: u64) {
        if idx == 0 {
            return;
        }
        self.regs[idx] = data;
    }
}


// sv39 pte fields: ppn0 = pte[18:10], ppn1 = pte[27:19], ppn2 = pte[53:28]

#[inline]
const fn pte_ppn(pte: u64) -> u64 {
    (pte >> 10) & 0xfff_ffff_fff
}


#[inline]
const fn pte_ppn1(pte: u64) -> u64 {
    (pte >> 19) & 0x1ff
}


#[inline]
const fn pte_ppn2(pte: u64) -> u64 {
    (pte >> 28) & 0x3ff_ffff
}


const INTERRUPT_PRIORITY: [(u64, Interrupt); 6] = [
    (MIP_MEIP, Interrupt::MachineExternal),
    (MIP_MSIP, Interrupt::MachineSoftware),
    (MIP_MTIP, Interrupt::MachineTimer),
    (MIP_SEIP, Interrupt::SupervisorExternal),
    (MIP_SSIP, Interrupt::SupervisorSoftware),
    (MIP_STIP, Interrupt::SupervisorTimer),
];


pub struct Cpu {
    pub x: Regs,
    pub pc: u64,
    pub mode: Priv,
    pub bus: Bus,
    pub csrs: [u64; 4096],
    pub enable_paging: bool,
    pub pagetable: u64,
}


impl Cpu {
    pub fn new(code: &[u8], disk: Vec<u8>) -> Self {
        let mut x = Regs::new();
        x.write(2, DRAM_BASE + DRAM_SIZE);

        Self {
            x,
            pc: DRAM_BASE,
            mode: Priv::Machine,
            bus: Bus::new(code, disk),
            csrs: [0; 4096],
            enable_paging: false,
            pagetable: 0,
        }
    }


    pub fn fetch(&mut self) -> Result<u32, Exception> {
        let pc = self.translate(self.pc, AccessType::Fetch)?;

        match self.bus.load(pc, 4) {
            Ok(inst) => Ok(inst as u32),
            Err(_) => Err(Exception::InstrAccessFault),
        }
    }


    pub fn load(&mut self, addr: u64, size: usize) -> Result<u64, Exception> {
        let addr = self.translate(addr, AccessType::Load)?;
        self.bus.load(addr, size)
    }


    pub fn store(&mut self, addr: u64, size: usize, value: u64) -> Result<(), Exception> {
        let addr = self.translate(addr, AccessType::Store)?;
        self.bus.store(addr, size, value)
    }


    pub fn load_csr(&self, addr: usize) -> u64 {
        if addr == CSR_SIE {
            return self.csrs[CSR_MIE] & self.csrs[CSR_MIDELEG];
        }
        self.csrs[addr]
    }


    pub fn store_csr(&mut self, addr: usize, value: u64) {
        if addr == CSR_SIE {
            let mideleg = self.csrs[CSR_MIDELEG];
            self.csrs[CSR_MIE] = (self.csrs[CSR_MIE] & !mideleg) | (value & mideleg);
            return;
        }
        self.csrs[addr] = value;
    }


    // the paging cache is derived from satp and only ever written here
    fn update_paging(&mut self, csr: usize) {
        if csr != CSR_SATP {
            return;
        }

        let satp = self.load_csr(CSR_SATP);
        self.pagetable = (satp & ((1 << 44) - 1)) * PAGE_SIZE;
        self.enable_paging = satp >> 60 == 8;

        debug!(
            "satp: pagetable {:#x}, sv39 {}",
            self.pagetable, self.enable_paging
        );
    }


    fn translate(&mut self, addr: u64, ty: AccessType) -> Result<u64, Exception> {
        if !self.enable_paging {
            return Ok(addr);
        }

        let vpn = [
            (addr >> 12) & 0x1ff,
            (addr >> 21) & 0x1ff,
            (addr >> 30) & 0x1ff,
        ];

        let mut a = self.pagetable;
        let mut i: i64 = 2;
        let pte = loop {
            let pte = self.bus.load(a + vpn[i as usize] * 8, 8)?;

            let v = pte & 1;
            let r = (pte >> 1) & 1;
            let w = (pte >> 2) & 1;
            let x = (pte >> 3) & 1;

            if v == 0 || (r == 0 && w == 1) {
                return Err(ty.fault());
            }

            // a leaf maps, anything else points one level down
            if r == 1 || x == 1 {
                break pte;
            }

            i -= 1;
            if i < 0 {
                return Err(ty.fault());
            }
            a = pte_ppn(pte) * PAGE_SIZE;
        };

        let offset = addr & 0xfff;

        Ok(match i {
            // 1 GiB superpage
            2 => pte_ppn2(pte) << 30 | vpn[1] << 21 | vpn[0] << 12 | offset,

            // 2 MiB superpage
            1 => pte_ppn2(pte) << 30 | pte_ppn1(pte) << 21 | vpn[0] << 12 | offset,

            _ => pte_ppn(pte) << 12 | offset,
        })
    }


    pub fn execute(&mut self, inst: u32) -> Result<(), Exception> {
        match Instr::decode(inst) {
            Instr::IAdd { rd, rs1, imm } => {
                let v = self.x.read(rs1 as usize).wrapping_add(imm as i64 as u64);
                self.x.write(rd as usize, v);
            }

            Instr::ISlt { rd, rs1, imm } => {
                let v = (self.x.read(rs1 as usize) as i64) < imm as i64;
                self.x.write(rd as usize, v as u64);
            }

            Instr::ISltu { rd, rs1, imm } => {
                let v = self.x.read(rs1 as usize) < imm as i64 as u64;
                self.x.write(rd as usize, v as u64);
            }

            Instr::IXor { rd, rs1, imm } => {
                self.x.write(rd as usize, self.x.read(rs1 as usize) ^ imm as i64 as u64);
            }

            Instr::IOr { rd, rs1, imm } => {
                self.x.write(rd as usize, self.x.read(rs1 as usize) | imm as i64 as u64);
            }

            Instr::IAnd { rd, rs1, imm } => {
                self.x.write(rd as usize, self.x.read(rs1 as usize) & imm as i64 as u64);
            }

            Instr::ISll { rd, rs1, shamt } => {
                self.x.write(rd as usize, self.x.read(rs1 as usize) << shamt);
            }

            Instr::ISrl { rd, rs1, shamt } => {
                self.x.write(rd as usize, self.x.read(rs1 as usize) >> shamt);
            }

            Instr::ISra { rd, rs1, shamt } => {
                let v = (self.x.read(rs1 as usize) as i64) >> shamt;
                self.x.write(rd as usize, v as u64);
            }

            Instr::IAddw { rd, rs1, imm } => {
                let v = (self.x.read(rs1 as usize) as i32).wrapping_add(imm as i32);
                self.x.write(rd as usize, v as i64 as u64);
            }

            Instr::ISllw { rd, rs1, shamt } => {
                let v = (self.x.read(rs1 as usize) as u32) << (shamt & 0x1f);
                self.x.write(rd as usize, v as i32 as i64 as u64);
            }

            Instr::ISrlw { rd, rs1, shamt } => {
                let v = (self.x.read(rs1 as usize) as u32) >> (shamt & 0x1f);
                self.x.write(rd as usize, v as i32 as i64 as u64);
            }

            Instr::ISraw { rd, rs1, shamt } => {
                let v = (self.x.read(rs1 as usize) as i32) >> (shamt & 0x1f);
                self.x.write(rd as usize, v as i64 as u64);
            }

            Instr::RAdd { rd, rs1, rs2 } => {
                let v = self.x.read(rs1 as usize).wrapping_add(self.x.read(rs2 as usize));
                self.x.write(rd as usize, v);
            }

            Instr::RSub { rd, rs1, rs2 } => {
                let v = self.x.read(rs1 as usize).wrapping_sub(self.x.read(rs2 as usize));
                self.x.write(rd as usize, v);
            }

            Instr::RSll { rd, rs1, rs2 } => {
                let v = self.x.read(rs1 as usize) << (self.x.read(rs2 as usize) & 0x3f);
                self.x.write(rd as usize, v);
            }

            Instr::RSlt { rd, rs1, rs2 } => {
                let v = (self.x.read(rs1 as usize) as i64) < (self.x.read(rs2 as usize) as i64);
                self.x.write(rd as usize, v as u64);
            }

            Instr::RSltu { rd, rs1, rs2 } => {
                let v = self.x.read(rs1 as usize) < self.x.read(rs2 as usize);
                self.x.write(rd as usize, v as u64);
            }

            Instr::RXor { rd, rs1, rs2 } => {
                self.x.write(rd as usize, self.x.read(rs1 as usize) ^ self.x.read(rs2 as usize));
            }

            Instr::RSrl { rd, rs1, rs2 } => {
                let v = self.x.read(rs1 as usize) >> (self.x.read(rs2 as usize) & 0x3f);
                self.x.write(rd as usize, v);
            }

            Instr::RSra { rd, rs1, rs2 } => {
                let v = (self.x.read(rs1 as usize) as i64) >> (self.x.read(rs2 as usize) & 0x3f);
                self.x.write(rd as usize, v as u64);
            }

            Instr::ROr { rd, rs1, rs2 } => {
                self.x.write(rd as usize, self.x.read(rs1 as usize) | self.x.read(rs2 as usize));
            }

            Instr::RAnd { rd, rs1, rs2 } => {
                self.x.write(rd as usize, self.x.read(rs1 as usize) & self.x.read(rs2 as usize));
            }

            Instr::RMul { rd, rs1, rs2 } => {
                let v = self.x.read(rs1 as usize).wrapping_mul(self.x.read(rs2 as usize));
                self.x.write(rd as usize, v);
            }

            Instr::RAddw { rd, rs1, rs2 } => {
                let v = (self.x.read(rs1 as usize) as u32).wrapping_add(self.x.read(rs2 as usize) as u32);
                self.x.write(rd as usize, v as i32 as i64 as u64);
            }

            Instr::RSubw { rd, rs1, rs2 } => {
                let v = (self.x.read(rs1 as usize) as u32).wrapping_sub(self.x.read(rs2 as usize) as u32);
                self.x.write(rd as usize, v as i32 as i64 as u64);
            }

            Instr::RSllw { rd, rs1, rs2 } => {
                let v = (self.x.read(rs1 as usize) as u32) << (self.x.read(rs2 as usize) & 0x1f);
                self.x.write(rd as usize, v as i32 as i64 as u64);
            }

            Instr::RSrlw { rd, rs1, rs2 } => {
                let v = (self.x.read(rs1 as usize) as u32) >> (self.x.read(rs2 as usize) & 0x1f);
                self.x.write(rd as usize, v as i32 as i64 as u64);
            }

            Instr::RSraw { rd, rs1, rs2 } => {
                let v = (self.x.read(rs1 as usize) as i32) >> (self.x.read(rs2 as usize) & 0x1f);
                self.x.write(rd as usize, v as i64 as u64);
            }

            Instr::RDivu { rd, rs1, rs2 } => {
                let lhs = self.x.read(rs1 as usize);
                let rhs = self.x.read(rs2 as usize);
                let v = if rhs == 0 { u64::MAX } else { lhs / rhs };
                self.x.write(rd as usize, v);
            }

            Instr::RRemuw { rd, rs1, rs2 } => {
                let lhs = self.x.read(rs1 as usize) as u32;
                let rhs = self.x.read(rs2 as usize) as u32;
                let v = if rhs == 0 { lhs } else { lhs % rhs };
                self.x.write(rd as usize, v as i32 as i64 as u64);
            }

            Instr::AmoAddW { rd, rs1, rs2 } => {
                let addr = self.x.read(rs1 as usize);
                let t = self.load(addr, 4)?;
                let v = (t as u32).wrapping_add(self.x.read(rs2 as usize) as u32);
                self.store(addr, 4, v as u64)?;
                self.x.write(rd as usize, t as i32 as i64 as u64);
            }

            Instr::AmoAddD { rd, rs1, rs2 } => {
                let addr = self.x.read(rs1 as usize);
                let t = self.load(addr, 8)?;
                self.store(addr, 8, t.wrapping_add(self.x.read(rs2 as usize)))?;
                self.x.write(rd as usize, t);
            }

            Instr::AmoSwapW { rd, rs1, rs2 } => {
                let addr = self.x.read(rs1 as usize);
                let t = self.load(addr, 4)?;
                self.store(addr, 4, self.x.read(rs2 as usize) & 0xffff_ffff)?;
                self.x.write(rd as usize, t as i32 as i64 as u64);
            }

            Instr::AmoSwapD { rd, rs1, rs2 } => {
                let addr = self.x.read(rs1 as usize);
                let t = self.load(addr, 8)?;
                self.store(addr, 8, self.x.read(rs2 as usize))?;
                self.x.write(rd as usize, t);
            }

            // pc already points past this instruction, so jump targets and
            // auipc are relative to pc - 4
            Instr::Jal { rd, offset } => {
                let t = self.pc;
                self.pc = self.pc.wrapping_sub(4).wrapping_add(offset as i64 as u64);
                self.x.write(rd as usize, t);
            }

            Instr::Auipc { rd, offset } => {
                let v = self.pc.wrapping_add(offset as i64 as u64).wrapping_sub(4);
                self.x.write(rd as usize, v);
            }

            Instr::Lui { rd, imm } => {
                self.x.write(rd as usize, imm as i64 as u64);
            }

            Instr::JAlr { rd, rs1, imm } => {
                let t = self.pc;
                self.pc = self.x.read(rs1 as usize).wrapping_add(imm as i64 as u64) & !1;
                self.x.write(rd as usize, t);
            }

            Instr::BEq { rs1, rs2, imm } => {
                if self.x.read(rs1 as usize) == self.x.read(rs2 as usize) {
                    self.pc = self.pc.wrapping_sub(4).wrapping_add(imm as i64 as u64);
                }
            }

            Instr::BNe { rs1, rs2, imm } => {
                if self.x.read(rs1 as usize) != self.x.read(rs2 as usize) {
                    self.pc = self.pc.wrapping_sub(4).wrapping_add(imm as i64 as u64);
                }
            }

            Instr::BLt { rs1, rs2, imm } => {
                if (self.x.read(rs1 as usize) as i64) < (self.x.read(rs2 as usize) as i64) {
                    self.pc = self.pc.wrapping_sub(4).wrapping_add(imm as i64 as u64);
                }
            }

            Instr::BGe { rs1, rs2, imm } => {
                if (self.x.read(rs1 as usize) as i64) >= (self.x.read(rs2 as usize) as i64) {
                    self.pc = self.pc.wrapping_sub(4).wrapping_add(imm as i64 as u64);
                }
            }

            Instr::BLtu { rs1, rs2, imm } => {
                if self.x.read(rs1 as usize) < self.x.read(rs2 as usize) {
                    self.pc = self.pc.wrapping_sub(4).wrapping_add(imm as i64 as u64);
                }
            }

            Instr::BGeu { rs1, rs2, imm } => {
                if self.x.read(rs1 as usize) >= self.x.read(rs2 as usize) {
                    self.pc = self.pc.wrapping_sub(4).wrapping_add(imm as i64 as u64);
                }
            }

            Instr::LB { rd, rs1, offset } => {
                let addr = self.x.read(rs1 as usize).wrapping_add(offset as i64 as u64);
                let v = self.load(addr, 1)?;
                self.x.write(rd as usize, v as i8 as i64 as u64);
            }

            Instr::LBu { rd, rs1, offset } => {
                let addr = self.x.read(rs1 as usize).wrapping_add(offset as i64 as u64);
                let v = self.load(addr, 1)?;
                self.x.write(rd as usize, v);
            }

            Instr::LH { rd, rs1, offset } => {
                let addr = self.x.read(rs1 as usize).wrapping_add(offset as i64 as u64);
                let v = self.load(addr, 2)?;
                self.x.write(rd as usize, v as i16 as i64 as u64);
            }

            Instr::LHu { rd, rs1, offset } => {
                let addr = self.x.read(rs1 as usize).wrapping_add(offset as i64 as u64);
                let v = self.load(addr, 2)?;
                self.x.write(rd as usize, v);
            }

            Instr::LW { rd, rs1, offset } => {
                let addr = self.x.read(rs1 as usize).wrapping_add(offset as i64 as u64);
                let v = self.load(addr, 4)?;
                self.x.write(rd as usize, v as i32 as i64 as u64);
            }

            Instr::LWu { rd, rs1, offset } => {
                let addr = self.x.read(rs1 as usize).wrapping_add(offset as i64 as u64);
                let v = self.load(addr, 4)?;
                self.x.write(rd as usize, v);
            }

            Instr::LD { rd, rs1, offset } => {
                let addr = self.x.read(rs1 as usize).wrapping_add(offset as i64 as u64);
                let v = self.load(addr, 8)?;
                self.x.write(rd as usize, v);
            }

            Instr::SB { rs1, rs2, offset } => {
                let addr = self.x.read(rs1 as usize).wrapping_add(offset as i64 as u64);
                self.store(addr, 1, self.x.read(rs2 as usize) & 0xff)?;
            }

            Instr::SH { rs1, rs2, offset } => {
                let addr = self.x.read(rs1 as usize).wrapping_add(offset as i64 as u64);
                self.store(addr, 2, self.x.read(rs2 as usize) & 0xffff)?;
            }

            Instr::SW { rs1, rs2, offset } => {
                let addr = self.x.read(rs1 as usize).wrapping_add(offset as i64 as u64);
                self.store(addr, 4, self.x.read(rs2 as usize) & 0xffff_ffff)?;
            }

            Instr::SD { rs1, rs2, offset } => {
                let addr = self.x.read(rs1 as usize).wrapping_add(offset as i64 as u64);
                self.store(addr, 8, self.x.read(rs2 as usize))?;
            }

            Instr::CsrRw { rd, rs1, csr } => {
                let csr = csr as usize;
                let t = self.load_csr(csr);
                self.store_csr(csr, self.x.read(rs1 as usize));
                self.x.write(rd as usize, t);
                self.update_paging(csr);
            }

            Instr::CsrRs { rd, rs1, csr } => {
                let csr = csr as usize;
                let t = self.load_csr(csr);
                self.store_csr(csr, t | self.x.read(rs1 as usize));
                self.x.write(rd as usize, t);
                self.update_paging(csr);
            }

            Instr::CsrRc { rd, rs1, csr } => {
                let csr = csr as usize;
                let t = self.load_csr(csr);
                self.store_csr(csr, t & !self.x.read(rs1 as usize));
                self.x.write(rd as usize, t);
                self.update_paging(csr);
            }

            Instr::CsrRwi { rd, rs1, csr } => {
                let csr = csr as usize;
                let t = self.load_csr(csr);
                self.store_csr(csr, rs1 as u64);
                self.x.write(rd as usize, t);
                self.update_paging(csr);
            }

            Instr::CsrRsi { rd, rs1, csr } => {
                let csr = csr as usize;
                let t = self.load_csr(csr);
                self.store_csr(csr, t | rs1 as u64);
                self.x.write(rd as usize, t);
                self.update_paging(csr);
            }

            Instr::CsrRci { rd, rs1, csr } => {
                let csr = csr as usize;
                let t = self.load_csr(csr);
                self.store_csr(csr, t & !(rs1 as u64));
                self.x.write(rd as usize, t);
                self.update_paging(csr);
            }

            Instr::SECall {} => {
                return Err(match self.mode {
                    Priv::User => Exception::EcallUmode,
                    Priv::Supervisor => Exception::EcallSmode,
                    Priv::Machine => Exception::EcallMmode,
                });
            }

            Instr::SEBreak {} => {
                return Err(Exception::Breakpoint);
            }

            Instr::SSRet {} => {
                self.ret(CSR_SSTATUS, CSR_SEPC, 1, 5, 8, 1);
            }

            Instr::SMRet {} => {
                self.ret(CSR_MSTATUS, CSR_MEPC, 3, 7, 11, 2);
            }

            Instr::SWfi {} => {}

            Instr::Fence => {}

            Instr::FenceVma => {}

            Instr::Unknown => {
                warn!("unknown encoding {inst:#010x} at pc {:#x}", self.pc.wrapping_sub(4));
                return Err(Exception::IllegalInstruction);
            }
        }

        Ok(())
    }


    // shared sret/mret tail: restore privilege from xPP, xIE from xPIE,
    // then set xPIE and clear xPP
    fn ret(
        &mut self,
        status_csr: usize,
        epc_csr: usize,
        ie_bit: u32,
        pie_bit: u32,
        pp_bit: u32,
        pp_len: u32,
    ) {
        self.pc = self.load_csr(epc_csr);

        let mut status = self.load_csr(status_csr);
        let pie = (status >> pie_bit) & 1;
        let pp = (status >> pp_bit) & ((1 << pp_len) - 1);

        self.mode = match pp {
            0 => Priv::User,
            1 => Priv::Supervisor,
            _ => Priv::Machine,
        };

        status = (status & !(1 << ie_bit)) | (pie << ie_bit); // xIE = xPIE
        status |= 1 << pie_bit;                               // xPIE = 1
        status &= !(((1u64 << pp_len) - 1) << pp_bit);        // xPP = 0
        self.store_csr(status_csr, status);
    }


    pub fn take_trap(&mut self, trap: Trap) {
        let (cause, interrupt) = match trap {
            Trap::Exception(e) => (e.code(), false),
            Trap::Interrupt(i) => (i.code(), true),
        };

        let exception_pc = self.pc.wrapping_sub(4);
        let prev_mode = self.mode;

        debug!(
            "trap: {} cause {cause} at pc {exception_pc:#x}, mode {prev_mode:?}",
            if interrupt { "interrupt" } else { "exception" },
        );

        let delegated = (self.load_csr(CSR_MEDELEG) >> cause) & 1 != 0;

        if prev_mode != Priv::Machine && delegated {
            self.mode = Priv::Supervisor;

            let stvec = self.load_csr(CSR_STVEC);
            self.pc = (stvec & !1)
                + if interrupt && stvec & 1 != 0 {
                    4 * cause
                } else {
                    0
                };

            self.store_csr(CSR_SEPC, exception_pc & !1);
            self.store_csr(CSR_SCAUSE, cause);
            self.store_csr(CSR_STVAL, 0);

            let mut s = self.load_csr(CSR_SSTATUS);
            let sie = (s >> 1) & 1;
            s = (s & !(1 << 5)) | (sie << 5); // SPIE = SIE
            s &= !(1 << 1);                   // SIE = 0
            s = (s & !(1 << 8)) | (((prev_mode == Priv::Supervisor) as u64) << 8); // SPP
            self.store_csr(CSR_SSTATUS, s);
        } else {
            self.mode = Priv::Machine;

            let mtvec = self.load_csr(CSR_MTVEC);
            self.pc = (mtvec & !1)
                + if interrupt && mtvec & 1 != 0 {
                    4 * cause
                } else {
                    0
                };

            self.store_csr(CSR_MEPC, exception_pc & !1);
            self.store_csr(CSR_MCAUSE, cause);
            self.store_csr(CSR_MTVAL, 0);

            let mut m = self.load_csr(CSR_MSTATUS);
            let mie = (m >> 3) & 1;
            m = (m & !(1 << 7)) | (mie << 7);                     // MPIE = MIE
            m &= !(1 << 3);                                       // MIE = 0
            m = (m & !(0b11 << 11)) | ((prev_mode as u64) << 11); // MPP
            self.store_csr(CSR_MSTATUS, m);
        }
    }


    pub fn check_pending_interrupt(&mut self) -> Option<Interrupt> {
        match self.mode {
            Priv::Machine if (self.load_csr(CSR_MSTATUS) >> 3) & 1 == 0 => return None,
            Priv::Supervisor if (self.load_csr(CSR_SSTATUS) >> 1) & 1 == 0 => return None,
            _ => {}
        }

        let irq = if self.bus.uart.interrupting() {
            Some(UART_IRQ)
        } else if self.bus.virtio.is_interrupting() {
            // service the queued block request before raising the irq
            self.bus.disk_access();
            Some(VIRTIO_IRQ)
        } else {
            None
        };

        if let Some(irq) = irq {
            self.bus
                .store(PLIC_SCLAIM, 4, irq)
                .expect("plic sclaim store");
            self.store_csr(CSR_MIP, self.load_csr(CSR_MIP) | MIP_SEIP);
        }

        let pending = self.load_csr(CSR_MIE) & self.load_csr(CSR_MIP);

        for (mask, interrupt) in INTERRUPT_PRIORITY {
            if pending & mask != 0 {
                self.store_csr(CSR_MIP, self.load_csr(CSR_MIP) & !mask);
                return Some(interrupt);
            }
        }

        None
    }
}
