use crate::io::{DeviceError, MMIOHandler, ServiceError};
use crate::scheduler::{EventQueue, Unit};

use common::access::Width;

use std::sync::{Arc, Mutex};

use delegate::delegate;
use log::{debug, error};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("no device at {0:#x}")]
    Unmapped(u64),
    #[error("device at {addr:#x}: {source}")]
    Device {
        addr: u64,
        #[source]
        source: DeviceError,
    },
    #[error("device {dev} {unit:?}: {source}")]
    Service {
        dev: usize,
        unit: Unit,
        #[source]
        source: ServiceError,
    },
}

// Routes physical addresses to peripherals and fires their scheduled services as
// simulated time advances.
pub struct Machine {
    queue: EventQueue,
    devices: Vec<Arc<Mutex<dyn MMIOHandler>>>,
}

impl Machine {
    pub fn new() -> Machine {
        Machine {
            queue: EventQueue::new(),
            devices: Vec::new(),
        }
    }

    delegate! {
        to self.queue {
            pub fn now(&self) -> u64;
            #[call(len)]
            pub fn pending_events(&self) -> usize;
        }
    }

    // Adds a device at the range it claims and resets it. The returned handle gives
    // the caller access to device internals.
    pub fn set_mmio_handler<M: MMIOHandler + 'static>(&mut self, handler: M) -> Arc<Mutex<M>> {
        let range = handler.range();
        for dev in self.devices.iter() {
            let other = dev.lock().unwrap().range();
            assert!(
                range.end <= other.start || other.end <= range.start,
                "MMIOHandler range {range:#x?} overlaps {other:#x?}"
            );
        }

        let handler = Arc::new(Mutex::new(handler));
        let idx = self.devices.len();
        handler.lock().unwrap().reset(&mut self.queue.for_device(idx));
        self.devices.push(handler.clone());
        handler
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        for (idx, dev) in self.devices.iter().enumerate() {
            dev.lock().unwrap().reset(&mut self.queue.for_device(idx));
        }
    }

    fn find(&self, addr: u64) -> Option<usize> {
        self.devices
            .iter()
            .position(|dev| dev.lock().unwrap().range().contains(&addr))
    }

    pub fn read(&mut self, addr: u64, width: Width) -> Result<u64, BusError> {
        let Some(idx) = self.find(addr) else {
            error!("Bus: {width} read of unmapped {addr:#x}");
            return Err(BusError::Unmapped(addr));
        };
        self.devices[idx]
            .lock()
            .unwrap()
            .read(addr, width)
            .map_err(|source| BusError::Device { addr, source })
    }

    pub fn write(&mut self, addr: u64, width: Width, val: u64) -> Result<(), BusError> {
        let Some(idx) = self.find(addr) else {
            error!("Bus: {width} write of unmapped {addr:#x}");
            return Err(BusError::Unmapped(addr));
        };
        self.devices[idx]
            .lock()
            .unwrap()
            .write(&mut self.queue.for_device(idx), addr, width, val)
            .map_err(|source| BusError::Device { addr, source })
    }

    pub fn read_byte(&mut self, addr: u64) -> Result<u8, BusError> {
        Ok(self.read(addr, Width::Byte)? as u8)
    }

    pub fn write_byte(&mut self, addr: u64, val: u8) -> Result<(), BusError> {
        self.write(addr, Width::Byte, val as u64)
    }

    // Fire everything due at the current tick, including events scheduled for
    // the current tick by the services themselves.
    fn fire_due(&mut self) -> Result<(), BusError> {
        while let Some(event) = self.queue.pop_due() {
            debug!("Sched: firing {:?} of device {} at {}", event.unit, event.dev, event.due);
            let dev = self.devices[event.dev].clone();
            dev.lock()
                .unwrap()
                .service(&mut self.queue.for_device(event.dev), event.unit)
                .map_err(|source| BusError::Service { dev: event.dev, unit: event.unit, source })?;
        }
        Ok(())
    }

    // Advance one tick.
    pub fn step(&mut self) -> Result<(), BusError> {
        self.queue.advance(1);
        self.fire_due()
    }

    // Advance ticks one at a time, stopping at the first failed service.
    pub fn run(&mut self, ticks: u64) -> Result<(), BusError> {
        for _ in 0..ticks {
            self.step()?;
        }
        Ok(())
    }

    // Advance until pred holds or limit ticks have elapsed. Returns whether pred held.
    pub fn run_until(&mut self, limit: u64, mut pred: impl FnMut(&mut Machine) -> bool) -> Result<bool, BusError> {
        for _ in 0..limit {
            if pred(self) {
                return Ok(true);
            }
            self.step()?;
        }
        Ok(pred(self))
    }

    pub fn irq(&self) -> bool {
        self.devices.iter().any(|dev| dev.lock().unwrap().irq())
    }

    pub fn device_irq(&self, idx: usize) -> bool {
        self.devices
            .get(idx)
            .is_some_and(|dev| dev.lock().unwrap().irq())
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
