use std::{env, fs, process};

use log::debug;

use zemu::{Cpu, Trap, ABI_NAMES, CSR_MCAUSE, CSR_MEPC, CSR_SCAUSE, CSR_SEPC};


fn usage() -> ! {
    eprintln!("usage: zemu <kernel-binary> [<disk-image>]");
    process::exit(1);
}


fn read_image(path: &str) -> Vec<u8> {
    match fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("zemu: {path}: {e}");
            process::exit(1);
        }
    }
}


fn dump_state(cpu: &Cpu) {
    eprintln!("pc = {:#018x}  mode = {:?}", cpu.pc, cpu.mode);

    for i in (0..32).step_by(4) {
        eprintln!(
            "{:>4} = {:#018x} {:>4} = {:#018x} {:>4} = {:#018x} {:>4} = {:#018x}",
            ABI_NAMES[i],
            cpu.x.read(i),
            ABI_NAMES[i + 1],
            cpu.x.read(i + 1),
            ABI_NAMES[i + 2],
            cpu.x.read(i + 2),
            ABI_NAMES[i + 3],
            cpu.x.read(i + 3),
        );
    }

    eprintln!(
        "mcause = {:#x}  mepc = {:#018x}  scause = {:#x}  sepc = {:#018x}",
        cpu.load_csr(CSR_MCAUSE),
        cpu.load_csr(CSR_MEPC),
        cpu.load_csr(CSR_SCAUSE),
        cpu.load_csr(CSR_SEPC),
    );
}


fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let kernel = match args.next() {
        Some(path) => path,
        None => usage(),
    };

    let code = read_image(&kernel);
    let disk = match args.next() {
        Some(path) => read_image(&path),
        None => Vec::new(),
    };

    debug!("loaded {} ({} bytes)", kernel, code.len());

    let mut cpu = Cpu::new(&code, disk);

    loop {
        let inst = match cpu.fetch() {
            Ok(inst) => inst,
            Err(e) => {
                cpu.take_trap(Trap::Exception(e));
                if e.is_fatal() {
                    break;
                }
                continue;
            }
        };

        cpu.pc = cpu.pc.wrapping_add(4);

        if let Err(e) = cpu.execute(inst) {
            cpu.take_trap(Trap::Exception(e));
            if e.is_fatal() {
                break;
            }
        }

        if let Some(interrupt) = cpu.check_pending_interrupt() {
            cpu.take_trap(Trap::Interrupt(interrupt));
        }
    }

    dump_state(&cpu);
}
