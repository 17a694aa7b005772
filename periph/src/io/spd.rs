use common::constants::{SPD_PAGE_SIZE, SPD_PROTECTED_END, SPD_SIZE};

// Serial presence detect EEPROM: 256 bytes behind an auto-incrementing address pointer.
#[derive(Debug, Clone)]
pub struct SpdDevice {
    storage: [u8; SPD_SIZE],
    pointer: u8,
    write_protected: bool,
}

impl Default for SpdDevice {
    fn default() -> Self {
        SpdDevice {
            storage: [0; SPD_SIZE],
            pointer: 0,
            write_protected: false,
        }
    }
}

impl SpdDevice {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_image(image: &[u8]) -> Self {
        let mut dev = Self::new();
        dev.load_image(image);
        dev
    }

    // Images shorter than the device leave the tail untouched; longer ones are truncated.
    pub fn load_image(&mut self, image: &[u8]) {
        let len = image.len().min(SPD_SIZE);
        self.storage[..len].copy_from_slice(&image[..len]);
    }

    pub fn image(&self) -> &[u8] {
        &self.storage
    }

    pub fn peek(&self, addr: u8) -> u8 {
        self.storage[addr as usize]
    }

    pub fn pointer(&self) -> u8 {
        self.pointer
    }

    pub fn set_pointer(&mut self, addr: u8) {
        self.pointer = addr;
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn set_write_protected(&mut self, protect: bool) {
        self.write_protected = protect;
    }

    pub fn reset(&mut self) {
        self.pointer = 0;
    }

    pub fn is_protected(&self, addr: u8) -> bool {
        self.write_protected && (addr as usize) < SPD_PROTECTED_END
    }

    pub fn is_page_start(addr: u8) -> bool {
        (addr as usize) % SPD_PAGE_SIZE == 0
    }

    // Byte at the pointer; the pointer advances and wraps.
    pub fn read_next(&mut self) -> u8 {
        let val = self.storage[self.pointer as usize];
        self.pointer = self.pointer.wrapping_add(1);
        val
    }

    // Store at the pointer unless refused; the pointer advances either way.
    // Returns whether the byte was stored.
    pub fn write_next(&mut self, val: u8, refuse: bool) -> bool {
        let stored = !refuse;
        if stored {
            self.storage[self.pointer as usize] = val;
        }
        self.pointer = self.pointer.wrapping_add(1);
        stored
    }
}
