pub mod io;
pub mod machine;
pub mod scheduler;

pub use io::{InterruptLine, MMIOHandler};
pub use machine::{BusError, Machine};
pub use scheduler::{Scheduler, Unit};
