use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::warn;

use crate::{Exception, UART_BASE};


pub const UART_RHR: u64 = UART_BASE;
pub const UART_THR: u64 = UART_BASE;
pub const UART_LCR: u64 = UART_BASE + 3;
pub const UART_LSR: u64 = UART_BASE + 5;

pub const LSR_RX_READY: u8 = 1;
pub const LSR_TX_READY: u8 = 1 << 5;

const RHR: usize = 0;
const LSR: usize = 5;

const UART_WINDOW: usize = 0x100;


pub struct Uart {
    regs: Arc<(Mutex<[u8; UART_WINDOW]>, Condvar)>,
    interrupting: Arc<AtomicBool>,
}


impl Uart {
    pub fn new() -> Self {
        let regs = Arc::new((Mutex::new([0; UART_WINDOW]), Condvar::new()));
        let interrupting = Arc::new(AtomicBool::new(false));

        {
            let (window, _) = &*regs;
            window.lock().unwrap()[LSR] |= LSR_TX_READY;
        }

        let rx_regs = Arc::clone(&regs);
        let rx_flag = Arc::clone(&interrupting);
        thread::spawn(move || {
            let mut byte = [0];
            loop {
                match io::stdin().read(&mut byte) {
                    // stdin closed, no more host input
                    Ok(0) => break,
                    Ok(_) => {
                        let (window, ready) = &*rx_regs;
                        let mut window = window.lock().unwrap();
                        while window[LSR] & LSR_RX_READY != 0 {
                            window = ready.wait(window).unwrap();
                        }
                        window[RHR] = byte[0];
                        window[LSR] |= LSR_RX_READY;
                        rx_flag.store(true, Ordering::Release);
                    }
                    Err(e) => {
                        warn!("uart: stdin read failed: {e}");
                        break;
                    }
                }
            }
        });

        Self { regs, interrupting }
    }


    pub fn load(&mut self, addr: u64, size: usize) -> Result<u64, Exception> {
        if size != 1 {
            return Err(Exception::LoadAccessFault);
        }

        let (window, ready) = &*self.regs;
        let mut window = window.lock().unwrap();

        match addr {
            UART_RHR => {
                window[LSR] &= !LSR_RX_READY;
                ready.notify_all();
                Ok(window[RHR] as u64)
            }
            _ => Ok(window[(addr - UART_BASE) as usize] as u64),
        }
    }


    pub fn store(&mut self, addr: u64, size: usize, value: u64) -> Result<(), Exception> {
        if size != 1 {
            return Err(Exception::StoreAccessFault);
        }

        let (window, _) = &*self.regs;
        let mut window = window.lock().unwrap();

        match addr {
            UART_THR => {
                let mut out = io::stdout();
                out.write_all(&[value as u8]).unwrap();
                out.flush().unwrap();
            }
            _ => window[(addr - UART_BASE) as usize] = value as u8,
        }

        Ok(())
    }


    pub fn interrupting(&self) -> bool {
        self.interrupting.swap(false, Ordering::AcqRel)
    }
}
