use crate::io::spd::SpdDevice;
use crate::io::{DeviceError, InterruptLine, MMIOHandler, ServiceError};
use crate::scheduler::{Scheduler, Unit};

use common::access::{Width, cell_index, check_aligned, extract, insert};
use common::constants::{I2C_SIZE, SPD_MAX_DEVICES};

use std::ops::Range;

use log::{error, trace, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum I2cError {
    #[error("command {0:#04x} combines START with both RD and WR")]
    ReadAndWrite(u8),
    #[error("command {0:#04x} reads before the address phase")]
    StartWithRead(u8),
    #[error("command {0:#04x} combines STOP with a transfer")]
    StopWithTransfer(u8),
    #[error("RD outside a read transfer")]
    ReadOutOfPhase,
    #[error("WR during a read transfer")]
    WriteOutOfPhase,
    #[error("slave select {0:#04x} doesn't name an attached SPD device")]
    UnknownSlave(u8),
    #[error("transfer already in progress")]
    Busy,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Read,
    WriteAddr,
    WriteDataFirst,
    WriteDataN,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
enum Reg {
    PrescaleLo = 0,
    PrescaleHi,
    Control,
    Data,    // TXR on write, RXR on read
    Command, // CR on write, SR on read
}

pub struct I2cController {
    base: u64,
    irq: InterruptLine,
    devices: Vec<SpdDevice>,

    phase: Phase,
    control: u8,
    status: u8,
    command: u8,
    transfer: u8, // Command that issued the pending phase
    transmit: u8,
    receive: u8,
    slave_select: u8,
    prescale_lo: u8,
    prescale_hi: u8,
}

impl I2cController {
    pub const CTR_EN: u8 = 0x1 << 7;
    pub const CTR_IEN: u8 = 0x1 << 6;

    pub const CMD_STA: u8 = 0x1 << 7;
    pub const CMD_STO: u8 = 0x1 << 6;
    pub const CMD_RD: u8 = 0x1 << 5;
    pub const CMD_WR: u8 = 0x1 << 4;
    pub const CMD_NACK: u8 = 0x1 << 3;
    pub const CMD_IACK: u8 = 0x1 << 0;

    pub const SR_NACK: u8 = 0x1 << 7;
    pub const SR_BUSY: u8 = 0x1 << 6;
    pub const SR_TIP: u8 = 0x1 << 1;
    pub const SR_IF: u8 = 0x1 << 0;

    // Slave select: bits 7:4 device class, 3:1 device index, 0 read.
    pub const SEL_CLASS_SHIFT: u8 = 4;
    pub const SEL_INDEX_SHIFT: u8 = 1;
    pub const SEL_INDEX_MASK: u8 = 0x7;
    pub const SEL_READ: u8 = 0x1;
    pub const CLASS_MEMORY: u8 = 0xa;

    pub const PHASE_DELAY_TICKS: u64 = 20;

    pub fn new(base: u64) -> Self {
        Self::with_devices(base, Vec::new())
    }

    pub fn with_devices(base: u64, mut devices: Vec<SpdDevice>) -> Self {
        if devices.len() > SPD_MAX_DEVICES {
            warn!("I2C: only {SPD_MAX_DEVICES} SPD devices addressable, dropping the rest");
            devices.truncate(SPD_MAX_DEVICES);
        }
        I2cController {
            base,
            irq: InterruptLine::new(),
            devices,

            phase: Phase::Idle,
            control: 0,
            status: 0,
            command: 0,
            transfer: 0,
            transmit: 0,
            receive: 0,
            slave_select: 0,
            prescale_lo: 0,
            prescale_hi: 0,
        }
    }

    // Returns the slot index, or the device back if every slot is taken.
    pub fn attach(&mut self, dev: SpdDevice) -> Result<usize, SpdDevice> {
        if self.devices.len() >= SPD_MAX_DEVICES {
            return Err(dev);
        }
        self.devices.push(dev);
        Ok(self.devices.len() - 1)
    }

    pub fn device(&self, idx: usize) -> Option<&SpdDevice> {
        self.devices.get(idx)
    }

    pub fn device_mut(&mut self, idx: usize) -> Option<&mut SpdDevice> {
        self.devices.get_mut(idx)
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn interrupt_line(&self) -> InterruptLine {
        self.irq.clone()
    }

    pub fn slave_address(dev: usize, read: bool) -> u8 {
        (Self::CLASS_MEMORY << Self::SEL_CLASS_SHIFT)
            | (((dev as u8) & Self::SEL_INDEX_MASK) << Self::SEL_INDEX_SHIFT)
            | (read as u8)
    }

    fn resolve(&self, select: u8) -> Result<u8, I2cError> {
        let class = select >> Self::SEL_CLASS_SHIFT;
        let idx = (select >> Self::SEL_INDEX_SHIFT) & Self::SEL_INDEX_MASK;
        if class != Self::CLASS_MEMORY || idx as usize >= self.devices.len() {
            return Err(I2cError::UnknownSlave(select));
        }
        Ok(idx)
    }

    fn update_irq(&self) {
        let pending = self.status & Self::SR_IF != 0;
        let enabled = self.control & Self::CTR_IEN != 0;
        self.irq.set(pending && enabled);
    }

    fn stop(&mut self, sched: &mut dyn Scheduler) {
        for idx in 0..SPD_MAX_DEVICES {
            sched.cancel(Unit::I2cSlave(idx as u8));
        }
        self.status &= !(Self::SR_BUSY | Self::SR_TIP);
        self.phase = Phase::Idle;
    }

    // Everything is checked before anything is committed, so a rejected command leaves
    // the controller exactly as it was.
    fn command_write(&mut self, sched: &mut dyn Scheduler, cmd: u8) -> Result<(), I2cError> {
        let start = cmd & Self::CMD_STA != 0;
        let stop = cmd & Self::CMD_STO != 0;
        let rd = cmd & Self::CMD_RD != 0;
        let wr = cmd & Self::CMD_WR != 0;

        if stop && (start || rd || wr) {
            return Err(I2cError::StopWithTransfer(cmd));
        }
        if start && rd && wr {
            return Err(I2cError::ReadAndWrite(cmd));
        }
        if start && rd {
            return Err(I2cError::StartWithRead(cmd));
        }

        let (phase, select) = if start {
            (Phase::Idle, self.transmit)
        } else {
            (self.phase, self.slave_select)
        };
        if rd && phase != Phase::Read {
            return Err(I2cError::ReadOutOfPhase);
        }
        if wr && phase == Phase::Read {
            return Err(I2cError::WriteOutOfPhase);
        }

        let target = if start || rd || wr {
            Some(self.resolve(select)?)
        } else {
            None
        };
        if target.is_some() && self.status & Self::SR_TIP != 0 {
            return Err(I2cError::Busy);
        }

        self.command = cmd;
        if cmd & Self::CMD_IACK != 0 {
            self.status &= !Self::SR_IF;
        }
        if stop {
            self.stop(sched);
        }
        if start {
            self.slave_select = select;
            self.status |= Self::SR_BUSY;
            self.phase = Phase::Idle;
        }
        if let Some(idx) = target {
            self.transfer = cmd;
            sched.schedule(Unit::I2cSlave(idx), Self::PHASE_DELAY_TICKS);
            self.status |= Self::SR_TIP;
        }
        Ok(())
    }

    fn reg_read(&self, reg: Reg) -> u8 {
        match reg {
            Reg::PrescaleLo => self.prescale_lo,
            Reg::PrescaleHi => self.prescale_hi,
            Reg::Control => self.control,
            Reg::Data => self.receive,
            Reg::Command => self.status,
        }
    }

    // Write-side cell contents, for read-modify-write.
    fn reg_peek(&self, reg: Reg) -> u8 {
        match reg {
            Reg::Data => self.transmit,
            Reg::Command => self.command,
            _ => self.reg_read(reg),
        }
    }

    fn reg_write(&mut self, sched: &mut dyn Scheduler, reg: Reg, val: u8) -> Result<(), I2cError> {
        match reg {
            Reg::PrescaleLo => self.prescale_lo = val,
            Reg::PrescaleHi => self.prescale_hi = val,
            Reg::Control => self.control = val,
            Reg::Data => self.transmit = val,
            Reg::Command => self.command_write(sched, val)?,
        }
        self.update_irq();
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////
    // Slave service
    ///////////////////////////////////////////////////////////////////////////

    // Shared by the first and subsequent data bytes of a write transfer. Page crossings
    // are only checked from the second byte on.
    fn write_data(&mut self, idx: usize, first: bool) {
        let dev = &mut self.devices[idx];
        let addr = dev.pointer();
        let refuse = dev.is_protected(addr) || (!first && SpdDevice::is_page_start(addr));
        if dev.write_next(self.transmit, refuse) {
            trace!("I2C: SPD {idx} [{addr:#04x}] <- {:#04x}", self.transmit);
            self.status &= !Self::SR_NACK;
        } else {
            trace!("I2C: SPD {idx} refused write to {addr:#04x}");
            self.status |= Self::SR_NACK;
        }
        self.phase = Phase::WriteDataN;
    }

    fn slave_service(&mut self, idx: usize) {
        if idx >= self.devices.len() {
            error!("I2C: service for missing SPD {idx}");
            return;
        }

        let prev = self.phase;
        match self.phase {
            Phase::Idle => {
                self.status &= !Self::SR_NACK;
                self.phase = if self.slave_select & Self::SEL_READ != 0 {
                    Phase::Read
                } else {
                    Phase::WriteAddr
                };
            }
            Phase::Read => {
                self.receive = self.devices[idx].read_next();
                if self.transfer & Self::CMD_NACK != 0 {
                    self.phase = Phase::Idle;
                }
            }
            Phase::WriteAddr => {
                self.devices[idx].set_pointer(self.transmit);
                self.status &= !Self::SR_NACK;
                self.phase = Phase::WriteDataFirst;
            }
            Phase::WriteDataFirst => self.write_data(idx, true),
            Phase::WriteDataN => self.write_data(idx, false),
        }
        trace!("I2C: SPD {idx} {prev:?} -> {:?}", self.phase);

        self.status &= !Self::SR_TIP;
        self.status |= Self::SR_IF;
        self.update_irq();
    }
}

impl MMIOHandler for I2cController {
    fn reset(&mut self, sched: &mut dyn Scheduler) {
        self.stop(sched);
        self.control = 0;
        self.status = 0;
        self.command = 0;
        self.transfer = 0;
        self.transmit = 0;
        self.receive = 0;
        self.slave_select = 0;
        self.prescale_lo = 0;
        self.prescale_hi = 0;
        for dev in self.devices.iter_mut() {
            dev.reset();
        }
        self.update_irq();
    }

    fn service(&mut self, _sched: &mut dyn Scheduler, unit: Unit) -> Result<(), ServiceError> {
        match unit {
            Unit::I2cSlave(idx) => self.slave_service(idx as usize),
            _ => error!("I2C: asked to service {unit:?}"),
        }
        Ok(())
    }

    fn range(&self) -> Range<u64> {
        self.base..self.base + I2C_SIZE
    }

    fn irq(&self) -> bool {
        self.irq.is_asserted()
    }

    fn read(&mut self, addr: u64, width: Width) -> Result<u64, DeviceError> {
        if let Err(e) = check_aligned(addr, width) {
            error!("I2C: {e}");
            return Err(e.into());
        }
        let Some(reg) = Reg::from_u64(cell_index(self.base, addr)) else {
            return Ok(0);
        };
        let val = self.reg_read(reg);
        trace!("I2C: read {val:#04x} from {reg:?}");
        Ok(extract(val as u64, addr, width))
    }

    fn write(&mut self, sched: &mut dyn Scheduler, addr: u64, width: Width, val: u64) -> Result<(), DeviceError> {
        if let Err(e) = check_aligned(addr, width) {
            error!("I2C: {e}");
            return Err(e.into());
        }
        let Some(reg) = Reg::from_u64(cell_index(self.base, addr)) else {
            return Ok(());
        };
        let val = insert(self.reg_peek(reg) as u64, addr, width, val) as u8;
        trace!("I2C: write {val:#04x} to {reg:?}");
        if let Err(e) = self.reg_write(sched, reg, val) {
            warn!("I2C: rejected command: {e}");
            return Err(e.into());
        }
        Ok(())
    }
}
