pub mod i2c;
pub mod serial;
pub mod spd;
pub mod uart;

use crate::scheduler::{Scheduler, Unit};
use crate::io::i2c::I2cError;
use crate::io::serial::TransportError;

use common::access::{AccessError, Width};

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Protocol(#[from] I2cError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
}

// Level-sensitive interrupt output. Written only by the owning device, sampled by
// whoever models the CPU's interrupt logic.
#[derive(Debug, Default, Clone)]
pub struct InterruptLine(Arc<AtomicBool>);

impl InterruptLine {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set(&self, level: bool) {
        self.0.store(level, Ordering::Relaxed);
    }

    pub fn is_asserted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub trait MMIOHandler: Send {
    fn reset(&mut self, _sched: &mut dyn Scheduler) {}

    // Called by the scheduler when a unit this device scheduled comes due.
    fn service(&mut self, sched: &mut dyn Scheduler, unit: Unit) -> Result<(), ServiceError>;

    // Physical address range claimed by the device.
    fn range(&self) -> Range<u64>;

    fn irq(&self) -> bool;

    fn read(&mut self, addr: u64, width: Width) -> Result<u64, DeviceError>;
    fn write(&mut self, sched: &mut dyn Scheduler, addr: u64, width: Width, val: u64) -> Result<(), DeviceError>;
}
