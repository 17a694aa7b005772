use log::debug;

// A schedulable unit of work belonging to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    UartRx,
    UartTx,
    UartFifo,
    I2cSlave(u8),
}

// What a device sees of the event scheduler. Tick advancement is not the device's
// business; it only asks for a service to run later, or withdraws that request.
pub trait Scheduler {
    // Scheduling a unit that is already pending leaves the pending event alone.
    fn schedule(&mut self, unit: Unit, delay: u64);
    // No effect if nothing is pending for unit.
    fn cancel(&mut self, unit: Unit);
    fn is_scheduled(&self, unit: Unit) -> bool;
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub due: u64,
    pub dev: usize,
    pub unit: Unit,
}

#[derive(Debug, Default)]
pub struct EventQueue {
    now: u64,
    // Sorted by due tick; insertion order is kept among equal ticks.
    events: Vec<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn advance(&mut self, ticks: u64) {
        self.now += ticks;
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn is_scheduled(&self, dev: usize, unit: Unit) -> bool {
        self.events.iter().any(|e| e.dev == dev && e.unit == unit)
    }

    pub fn schedule(&mut self, dev: usize, unit: Unit, delay: u64) {
        if self.is_scheduled(dev, unit) {
            debug!("Sched: {unit:?} of device {dev} already pending");
            return;
        }
        let due = self.now + delay;
        let idx = self.events.partition_point(|e| e.due <= due);
        debug!("Sched: {unit:?} of device {dev} due at {due}");
        self.events.insert(idx, Event { due, dev, unit });
    }

    pub fn cancel(&mut self, dev: usize, unit: Unit) {
        self.events.retain(|e| !(e.dev == dev && e.unit == unit));
    }

    // Remove and return the earliest event that is due, if any.
    pub fn pop_due(&mut self) -> Option<Event> {
        match self.events.first() {
            Some(e) if e.due <= self.now => Some(self.events.remove(0)),
            _ => None,
        }
    }

    pub fn for_device(&mut self, dev: usize) -> DeviceScheduler<'_> {
        DeviceScheduler { queue: self, dev }
    }
}

// Scheduler handle handed to a single device, tagging its units with the device index.
pub struct DeviceScheduler<'a> {
    queue: &'a mut EventQueue,
    dev: usize,
}

impl Scheduler for DeviceScheduler<'_> {
    fn schedule(&mut self, unit: Unit, delay: u64) {
        self.queue.schedule(self.dev, unit, delay);
    }

    fn cancel(&mut self, unit: Unit) {
        self.queue.cancel(self.dev, unit);
    }

    fn is_scheduled(&self, unit: Unit) -> bool {
        self.queue.is_scheduled(self.dev, unit)
    }
}
