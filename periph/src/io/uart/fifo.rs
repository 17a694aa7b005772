pub const FIFO_CAPACITY: usize = 16;

// Error conditions that travel with a received character.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntryFlags {
    pub brk: bool,
    pub parity: bool,
}

impl EntryFlags {
    pub fn is_error(self) -> bool {
        self.brk || self.parity
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub val: u8,
    pub flags: EntryFlags,
}

impl Entry {
    pub fn new(val: u8) -> Self {
        Entry { val, flags: EntryFlags::default() }
    }

    pub fn brk() -> Self {
        Entry { val: 0, flags: EntryFlags { brk: true, parity: false } }
    }
}

#[derive(Debug, Default)]
pub struct Fifo {
    entries: [Entry; FIFO_CAPACITY],
    insert_ptr: usize,
    remove_ptr: usize,
    count: usize,
}

impl Fifo {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        self.insert_ptr = 0;
        self.remove_ptr = 0;
        self.count = 0;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == FIFO_CAPACITY
    }

    // (insert, remove, count)
    pub fn pointers(&self) -> (usize, usize, usize) {
        (self.insert_ptr, self.remove_ptr, self.count)
    }

    // Returns false, leaving the FIFO untouched, when full.
    pub fn push(&mut self, entry: Entry) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries[self.insert_ptr] = entry;
        self.insert_ptr = (self.insert_ptr + 1) % FIFO_CAPACITY;
        self.count += 1;
        true
    }

    pub fn pop(&mut self) -> Option<Entry> {
        if self.is_empty() {
            return None;
        }
        let entry = self.entries[self.remove_ptr];
        self.remove_ptr = (self.remove_ptr + 1) % FIFO_CAPACITY;
        self.count -= 1;
        Some(entry)
    }

    pub fn head(&self) -> Option<&Entry> {
        if self.is_empty() {
            None
        } else {
            Some(&self.entries[self.remove_ptr])
        }
    }

    // Occupied entries, head first.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> + '_ {
        (0..self.count).map(move |i| &self.entries[(self.remove_ptr + i) % FIFO_CAPACITY])
    }
}
