// Every register occupies one 64-bit cell on the bus.
pub const CELL_BYTES: u64 = 8;
pub const CELL_SHIFT: u32 = 3;

pub const UART_BASE: u64 = 0x1_0000_0000;
pub const UART_CELLS: u64 = 8;
pub const UART_SIZE: u64 = UART_CELLS * CELL_BYTES;

pub const I2C_BASE: u64 = 0x1_0000_1000;
pub const I2C_CELLS: u64 = 5;
pub const I2C_SIZE: u64 = I2C_CELLS * CELL_BYTES;

pub const SPD_SIZE: usize = 256;
pub const SPD_PAGE_SIZE: usize = 16;
pub const SPD_PROTECTED_END: usize = 128; // Exclusive
pub const SPD_MAX_DEVICES: usize = 8;
