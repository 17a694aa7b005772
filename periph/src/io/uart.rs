pub mod fifo;

use crate::io::serial::{Mirror, NullMirror, RxChar, SerialPort};
use crate::io::{DeviceError, InterruptLine, MMIOHandler, ServiceError};
use crate::scheduler::{Scheduler, Unit};
use fifo::{Entry, EntryFlags, Fifo};

use common::access::{Width, cell_index, check_aligned, extract, insert};
use common::constants::UART_SIZE;

use std::ops::Range;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
enum Reg {
    Data = 0,   // RBUF/XBUF, or divisor low with DLAB
    IntrEnable, // Or divisor high with DLAB
    IntrIdent,  // IID on read, FCTL on write
    LineCtrl,
    ModemCtrl,
    LineStatus,
    ModemStatus,
    Scratch,
}

// Interrupt causes as named flags. The encoded IID only exists at read time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Causes {
    pub line_status: bool,
    pub rx_alarm: bool,
    pub rx_timeout: bool,
    pub tx_empty: bool,
    pub modem: bool,
}

impl Causes {
    fn masked(self, enables: Causes) -> Causes {
        Causes {
            line_status: self.line_status && enables.line_status,
            rx_alarm: self.rx_alarm && enables.rx_alarm,
            rx_timeout: self.rx_timeout && enables.rx_timeout,
            tx_empty: self.tx_empty && enables.tx_empty,
            modem: self.modem && enables.modem,
        }
    }

    pub fn any(self) -> bool {
        self.highest().is_some()
    }

    // Highest priority cause present.
    pub fn highest(self) -> Option<Cause> {
        if self.line_status {
            Some(Cause::LineStatus)
        } else if self.rx_alarm {
            Some(Cause::RxAlarm)
        } else if self.rx_timeout {
            Some(Cause::RxTimeout)
        } else if self.tx_empty {
            Some(Cause::TxEmpty)
        } else if self.modem {
            Some(Cause::ModemStatus)
        } else {
            None
        }
    }
}

// IID encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    ModemStatus = 0x0,
    TxEmpty = 0x2,
    RxAlarm = 0x4,
    LineStatus = 0x6,
    RxTimeout = 0xc,
}

////////////////////////////////////////////////////////////////////////////////

pub struct Uart {
    base: u64,
    port: Arc<dyn SerialPort>,
    mirror: Arc<dyn Mirror>,
    irq: InterruptLine,

    line_control: u8,
    line_status: u8, // Only the error bits accumulated since the last LSTA read
    modem_control: u8,
    modem_status: u8,
    interrupt_enable: u8,
    fifo_control: u8,
    divisor_lo: u8,
    divisor_hi: u8,
    scratch: u8,

    causes: Causes,
    rx_timeout: u32,
    rx_threshold: usize,

    xmit_hold: u8,
    xmit_full: bool,

    rx_fifo: Fifo,
    tx_fifo: Fifo,
}

impl Uart {
    pub const LCTL_WLS_MASK: u8 = 0x3;
    pub const LCTL_PEN: u8 = 0x1 << 3;
    pub const LCTL_EPS: u8 = 0x1 << 4;
    pub const LCTL_STICK: u8 = 0x1 << 5;
    pub const LCTL_BREAK: u8 = 0x1 << 6;
    pub const LCTL_DLAB: u8 = 0x1 << 7;

    pub const LSTA_DRDY: u8 = 0x1 << 0;
    pub const LSTA_OE: u8 = 0x1 << 1;
    pub const LSTA_PE: u8 = 0x1 << 2;
    pub const LSTA_FE: u8 = 0x1 << 3;
    pub const LSTA_BI: u8 = 0x1 << 4;
    pub const LSTA_FEMP: u8 = 0x1 << 5;
    pub const LSTA_XEMP: u8 = 0x1 << 6;
    pub const LSTA_ERR: u8 = 0x1 << 7;
    const LSTA_ACCUM_MASK: u8 = Self::LSTA_BI | Self::LSTA_PE | Self::LSTA_FE | Self::LSTA_OE;

    pub const IE_RX_ALARM: u8 = 0x1 << 0;
    pub const IE_TX_EMPTY: u8 = 0x1 << 1;
    pub const IE_LINE_STATUS: u8 = 0x1 << 2;
    pub const IE_MODEM: u8 = 0x1 << 3;
    const IE_MASK: u8 = 0xf;

    pub const FCTL_ENABLE: u8 = 0x1 << 0;
    pub const FCTL_RX_RESET: u8 = 0x1 << 1;
    pub const FCTL_TX_RESET: u8 = 0x1 << 2;
    pub const FCTL_TRIGGER_SHIFT: u8 = 6;
    const THRESHOLDS: [usize; 4] = [1, 4, 8, 14];

    pub const IID_NONE: u8 = 0x1;
    pub const IID_FIFO_BITS: u8 = 0xc0;

    // DCD | DSR | CTS
    pub const MSTA_FIXED: u8 = 0xb0;

    pub const RX_POLL_TICKS: u64 = 50;
    pub const RX_TIMEOUT_POLLS: u32 = 4;
    pub const FIFO_DELAY_TICKS: u64 = 1;
    pub const TX_DELAY_TICKS: u64 = 10;

    pub fn new(base: u64, port: Arc<dyn SerialPort>) -> Self {
        Self::with_mirror(base, port, Arc::new(NullMirror()))
    }

    pub fn with_mirror(base: u64, port: Arc<dyn SerialPort>, mirror: Arc<dyn Mirror>) -> Self {
        Uart {
            base,
            port,
            mirror,
            irq: InterruptLine::new(),

            line_control: 0,
            line_status: 0,
            modem_control: 0,
            modem_status: Self::MSTA_FIXED,
            interrupt_enable: 0,
            fifo_control: 0,
            divisor_lo: 0,
            divisor_hi: 0,
            scratch: 0,

            causes: Causes { tx_empty: true, ..Default::default() },
            rx_timeout: 0,
            rx_threshold: Self::THRESHOLDS[0],

            xmit_hold: 0,
            xmit_full: false,

            rx_fifo: Fifo::new(),
            tx_fifo: Fifo::new(),
        }
    }

    pub fn interrupt_line(&self) -> InterruptLine {
        self.irq.clone()
    }

    pub fn causes(&self) -> Causes {
        self.causes
    }

    pub fn divisor(&self) -> u16 {
        u16::from_le_bytes([self.divisor_lo, self.divisor_hi])
    }

    pub fn rx_threshold(&self) -> usize {
        self.rx_threshold
    }

    pub fn rx_timeout(&self) -> u32 {
        self.rx_timeout
    }

    // (insert, remove, count)
    pub fn rx_pointers(&self) -> (usize, usize, usize) {
        self.rx_fifo.pointers()
    }

    pub fn tx_pointers(&self) -> (usize, usize, usize) {
        self.tx_fifo.pointers()
    }

    pub fn is_xmit_full(&self) -> bool {
        self.xmit_full
    }

    fn is_dlab(&self) -> bool {
        self.line_control & Self::LCTL_DLAB != 0
    }

    ///////////////////////////////////////////////////////////////////////////
    // Interrupt resolution
    ///////////////////////////////////////////////////////////////////////////

    fn enables(&self) -> Causes {
        let ie = self.interrupt_enable;
        Causes {
            line_status: ie & Self::IE_LINE_STATUS != 0,
            rx_alarm: ie & Self::IE_RX_ALARM != 0,
            // The receive enable also gates the timeout.
            rx_timeout: ie & Self::IE_RX_ALARM != 0,
            tx_empty: ie & Self::IE_TX_EMPTY != 0,
            modem: ie & Self::IE_MODEM != 0,
        }
    }

    fn pending(&self) -> Causes {
        self.causes.masked(self.enables())
    }

    pub fn interrupt_id(&self) -> u8 {
        let code = match self.pending().highest() {
            Some(cause) => cause as u8,
            None => Self::IID_NONE,
        };
        Self::IID_FIFO_BITS | code
    }

    fn update_irq(&self) {
        self.irq.set(self.pending().any());
    }

    ///////////////////////////////////////////////////////////////////////////
    // Framing
    ///////////////////////////////////////////////////////////////////////////

    fn data_bits(&self) -> u32 {
        5 + (self.line_control & Self::LCTL_WLS_MASK) as u32
    }

    fn parity_enabled(&self) -> bool {
        self.line_control & Self::LCTL_PEN != 0
    }

    // Parity bit for 7 data bits under the current line control.
    fn parity_bit(&self, data: u8) -> u8 {
        let even = self.line_control & Self::LCTL_EPS != 0;
        if self.line_control & Self::LCTL_STICK != 0 {
            return (!even) as u8;
        }
        let odd_ones = (data.count_ones() & 0x1) as u8;
        if even { odd_ones } else { odd_ones ^ 0x1 }
    }

    fn frame_tx(&self, val: u8) -> u8 {
        match self.data_bits() {
            8 if self.parity_enabled() => {
                let data = val & 0x7f;
                data | (self.parity_bit(data) << 7)
            }
            8 => val,
            bits => val & ((1u8 << bits) - 1),
        }
    }

    fn frame_rx(&self, val: u8) -> Entry {
        match self.data_bits() {
            8 if self.parity_enabled() => {
                let data = val & 0x7f;
                let parity = (val >> 7) != self.parity_bit(data);
                Entry { val: data, flags: EntryFlags { brk: false, parity } }
            }
            8 => Entry::new(val),
            bits => Entry::new(val & ((1u8 << bits) - 1)),
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Register access
    ///////////////////////////////////////////////////////////////////////////

    // Error status is visible one entry ahead of the data being read.
    fn check_rx_head(&mut self) {
        let Some(head) = self.rx_fifo.head() else {
            return;
        };
        let flags = head.flags;
        if flags.brk {
            self.line_status |= Self::LSTA_BI;
        }
        if flags.parity {
            self.line_status |= Self::LSTA_PE;
        }
        if flags.is_error() {
            self.causes.line_status = true;
        }
    }

    fn rbuf_read(&mut self) -> u8 {
        let val = self.rx_fifo.pop().map_or(0, |e| e.val);
        self.causes.rx_timeout = false;
        self.check_rx_head();
        if self.rx_fifo.len() < self.rx_threshold {
            self.causes.rx_alarm = false;
        }
        val
    }

    fn lsta_read(&mut self) -> u8 {
        let mut val = self.line_status & Self::LSTA_ACCUM_MASK;
        if !self.rx_fifo.is_empty() {
            val |= Self::LSTA_DRDY;
        }
        if self.tx_fifo.is_empty() {
            val |= Self::LSTA_FEMP;
            if !self.xmit_full {
                val |= Self::LSTA_XEMP;
            }
        }
        if self.rx_fifo.iter().any(|e| e.flags.is_error()) {
            val |= Self::LSTA_ERR;
        }

        self.line_status &= !Self::LSTA_ACCUM_MASK;
        self.causes.line_status = false;
        val
    }

    fn reg_read(&mut self, reg: Reg) -> u8 {
        let dlab = self.is_dlab();
        match reg {
            Reg::Data if dlab => self.divisor_lo,
            Reg::Data => self.rbuf_read(),
            Reg::IntrEnable if dlab => self.divisor_hi,
            Reg::IntrEnable => self.interrupt_enable,
            Reg::IntrIdent => self.interrupt_id(),
            Reg::LineCtrl => self.line_control,
            Reg::ModemCtrl => self.modem_control,
            Reg::LineStatus => self.lsta_read(),
            Reg::ModemStatus => {
                self.causes.modem = false;
                self.modem_status
            }
            Reg::Scratch => self.scratch,
        }
    }

    // Current cell contents without read side effects, for read-modify-write.
    fn reg_peek(&self, reg: Reg) -> u8 {
        let dlab = self.is_dlab();
        match reg {
            Reg::Data if dlab => self.divisor_lo,
            Reg::Data => self.xmit_hold,
            Reg::IntrEnable if dlab => self.divisor_hi,
            Reg::IntrEnable => self.interrupt_enable,
            Reg::IntrIdent => self.fifo_control,
            Reg::LineCtrl => self.line_control,
            Reg::ModemCtrl => self.modem_control,
            Reg::LineStatus => self.line_status,
            Reg::ModemStatus => self.modem_status,
            Reg::Scratch => self.scratch,
        }
    }

    fn xbuf_write(&mut self, sched: &mut dyn Scheduler, val: u8) {
        if self.xmit_full {
            warn!("UART: transmit hold overwritten, {:#04x} lost", self.xmit_hold);
        }
        self.xmit_hold = self.frame_tx(val);
        self.xmit_full = true;
        self.causes.tx_empty = false;
        sched.schedule(Unit::UartFifo, Self::FIFO_DELAY_TICKS);
    }

    fn fctl_write(&mut self, sched: &mut dyn Scheduler, val: u8) {
        self.fifo_control = val;
        if val & Self::FCTL_RX_RESET != 0 {
            self.rx_fifo.reset();
            self.rx_timeout = 0;
            self.causes.rx_alarm = false;
            self.causes.rx_timeout = false;
        }
        if val & Self::FCTL_TX_RESET != 0 {
            self.tx_fifo.reset();
            sched.cancel(Unit::UartTx);
            if self.xmit_full {
                // The insertion service may have already given up on a full FIFO.
                sched.schedule(Unit::UartFifo, Self::FIFO_DELAY_TICKS);
            } else {
                self.causes.tx_empty = true;
            }
        }
        self.rx_threshold = Self::THRESHOLDS[(val >> Self::FCTL_TRIGGER_SHIFT) as usize];
        self.check_rx_head();
    }

    fn reg_write(&mut self, sched: &mut dyn Scheduler, reg: Reg, val: u8) {
        let dlab = self.is_dlab();
        match reg {
            Reg::Data if dlab => self.divisor_lo = val,
            Reg::Data => self.xbuf_write(sched, val),
            Reg::IntrEnable if dlab => self.divisor_hi = val,
            Reg::IntrEnable => self.interrupt_enable = val & Self::IE_MASK,
            Reg::IntrIdent => self.fctl_write(sched, val),
            Reg::LineCtrl => self.line_control = val,
            Reg::ModemCtrl => self.modem_control = val,
            Reg::LineStatus | Reg::ModemStatus => {
                trace!("UART: ignoring write of {val:#04x} to {reg:?}");
            }
            Reg::Scratch => self.scratch = val,
        }
        self.update_irq();
    }

    ///////////////////////////////////////////////////////////////////////////
    // Services
    ///////////////////////////////////////////////////////////////////////////

    fn receive(&mut self, ch: RxChar) {
        let entry = match ch {
            RxChar::Break => Entry::brk(),
            RxChar::Byte(val) => self.frame_rx(val),
        };

        if !self.rx_fifo.push(entry) {
            debug!("UART: receive overrun, dropping {:#04x}", entry.val);
            self.line_status |= Self::LSTA_OE;
            self.causes.line_status = true;
        } else if self.rx_fifo.len() >= self.rx_threshold {
            self.causes.rx_alarm = true;
            self.rx_timeout = 0;
        } else {
            self.rx_timeout = Self::RX_TIMEOUT_POLLS;
        }
        self.check_rx_head();
    }

    fn rx_service(&mut self, sched: &mut dyn Scheduler) -> Result<(), ServiceError> {
        sched.schedule(Unit::UartRx, Self::RX_POLL_TICKS);

        match self.port.poll_input()? {
            Some(ch) => {
                trace!("UART: received {ch:?}");
                self.receive(ch);
            }
            None if self.rx_timeout > 0 => {
                self.rx_timeout -= 1;
                if self.rx_timeout == 0 {
                    self.causes.rx_timeout = true;
                }
            }
            None => (),
        }
        self.update_irq();
        Ok(())
    }

    // Move the hold register into the transmit FIFO if there's room.
    fn fifo_insert(&mut self, sched: &mut dyn Scheduler) {
        if self.xmit_full && self.tx_fifo.push(Entry::new(self.xmit_hold)) {
            self.xmit_full = false;
            sched.schedule(Unit::UartTx, Self::TX_DELAY_TICKS);
        }
    }

    fn tx_service(&mut self, sched: &mut dyn Scheduler) -> Result<(), ServiceError> {
        if let Some(head) = self.tx_fifo.head() {
            let val = head.val;
            let status = self.port.try_output(val)?;
            if status.is_would_block() {
                sched.schedule(Unit::UartTx, Self::TX_DELAY_TICKS);
                self.update_irq();
                return Ok(());
            }
            self.tx_fifo.pop();
            if let Err(e) = self.mirror.mirror(val) {
                debug!("UART: mirror failed: {e}");
            }
            if !self.tx_fifo.is_empty() {
                sched.schedule(Unit::UartTx, Self::TX_DELAY_TICKS);
            }
        }

        if self.xmit_full {
            self.fifo_insert(sched);
        } else if self.tx_fifo.is_empty() {
            self.causes.tx_empty = true;
        }
        self.update_irq();
        Ok(())
    }
}

impl MMIOHandler for Uart {
    fn reset(&mut self, sched: &mut dyn Scheduler) {
        let port = self.port.clone();
        let mirror = self.mirror.clone();
        let irq = self.irq.clone();
        *self = Uart { irq, ..Uart::with_mirror(self.base, port, mirror) };

        sched.cancel(Unit::UartTx);
        sched.cancel(Unit::UartFifo);
        sched.schedule(Unit::UartRx, Self::RX_POLL_TICKS);
        self.update_irq();
    }

    fn service(&mut self, sched: &mut dyn Scheduler, unit: Unit) -> Result<(), ServiceError> {
        match unit {
            Unit::UartRx => self.rx_service(sched),
            Unit::UartTx => self.tx_service(sched),
            Unit::UartFifo => {
                self.fifo_insert(sched);
                self.update_irq();
                Ok(())
            }
            Unit::I2cSlave(_) => {
                error!("UART: asked to service {unit:?}");
                Ok(())
            }
        }
    }

    fn range(&self) -> Range<u64> {
        self.base..self.base + UART_SIZE
    }

    fn irq(&self) -> bool {
        self.irq.is_asserted()
    }

    fn read(&mut self, addr: u64, width: Width) -> Result<u64, DeviceError> {
        if let Err(e) = check_aligned(addr, width) {
            error!("UART: {e}");
            return Err(e.into());
        }
        let Some(reg) = Reg::from_u64(cell_index(self.base, addr)) else {
            return Ok(0);
        };
        let val = self.reg_read(reg);
        self.update_irq();
        trace!("UART: read {val:#04x} from {reg:?}");
        Ok(extract(val as u64, addr, width))
    }

    fn write(&mut self, sched: &mut dyn Scheduler, addr: u64, width: Width, val: u64) -> Result<(), DeviceError> {
        if let Err(e) = check_aligned(addr, width) {
            error!("UART: {e}");
            return Err(e.into());
        }
        let Some(reg) = Reg::from_u64(cell_index(self.base, addr)) else {
            return Ok(());
        };
        let cell = self.reg_peek(reg) as u64;
        let val = insert(cell, addr, width, val) as u8;
        trace!("UART: write {val:#04x} to {reg:?}");
        self.reg_write(sched, reg, val);
        Ok(())
    }
}
