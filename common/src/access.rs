use crate::constants::{CELL_BYTES, CELL_SHIFT};

use derive_more::Display;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Display)]
pub enum Width {
    #[display(fmt = "byte")]
    Byte = 1,
    #[display(fmt = "word")]
    Word = 2,
    #[display(fmt = "long")]
    Long = 4,
    #[display(fmt = "quad")]
    Quad = 8,
}

impl Width {
    pub fn from_bytes(bytes: u8) -> Option<Width> {
        Width::from_u8(bytes)
    }

    pub fn bytes(self) -> u64 {
        self as u64
    }

    pub fn bits(self) -> u32 {
        (self.bytes() * 8) as u32
    }

    pub fn mask(self) -> u64 {
        match self {
            Width::Quad => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("{width} access to {addr:#x} is not aligned to a register cell")]
    Misaligned { addr: u64, width: Width },
}

////////////////////////////////////////////////////////////////////////////////

pub fn check_aligned(addr: u64, width: Width) -> Result<(), AccessError> {
    if addr & (CELL_BYTES - 1) != 0 {
        return Err(AccessError::Misaligned { addr, width });
    }
    Ok(())
}

// Index of the register cell containing addr, relative to base.
pub fn cell_index(base: u64, addr: u64) -> u64 {
    (addr - base) >> CELL_SHIFT
}

fn lane_shift(addr: u64) -> u32 {
    ((addr & (CELL_BYTES - 1)) * 8) as u32
}

// Pull the lane selected by addr and width out of a 64-bit cell.
pub fn extract(cell: u64, addr: u64, width: Width) -> u64 {
    (cell >> lane_shift(addr)) & width.mask()
}

// Replace the lane selected by addr and width, leaving the other lanes alone.
pub fn insert(cell: u64, addr: u64, width: Width, val: u64) -> u64 {
    let shift = lane_shift(addr);
    let mask = width.mask() << shift;
    (cell & !mask) | ((val & width.mask()) << shift)
}
