use std::collections::VecDeque;
use std::io::{self, ErrorKind, Write, stdout};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use derive_more::IsVariant;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxChar {
    Byte(u8),
    Break,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum TxStatus {
    Accepted,
    WouldBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("serial peer disconnected")]
    Disconnected,
}

// The character source/sink a UART is wired to.
pub trait SerialPort: Send + Sync {
    fn poll_input(&self) -> Result<Option<RxChar>, TransportError>;
    fn try_output(&self, val: u8) -> Result<TxStatus, TransportError>;
}

// Best-effort copy of everything the UART transmits. Errors are the caller's to ignore.
pub trait Mirror: Send + Sync {
    fn mirror(&self, val: u8) -> io::Result<()>;
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
pub struct PipeSerial {
    out_buf: Mutex<VecDeque<u8>>,
    in_buf: Mutex<VecDeque<RxChar>>,
    blocked: AtomicBool,
    disconnected: AtomicBool,
}

impl PipeSerial {
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *self.out_buf.lock().unwrap()).into()
    }

    pub fn is_out_empty(&self) -> bool {
        self.out_buf.lock().unwrap().is_empty()
    }

    pub fn pop_output(&self) -> Option<u8> {
        self.out_buf.lock().unwrap().pop_front()
    }

    pub fn push_input(&self, val: u8) {
        self.in_buf.lock().unwrap().push_back(RxChar::Byte(val));
    }

    pub fn push_break(&self) {
        self.in_buf.lock().unwrap().push_back(RxChar::Break);
    }

    pub fn write_input(&self, vals: &[u8]) {
        for val in vals.iter() {
            self.push_input(*val);
        }
    }

    pub fn input_len(&self) -> usize {
        self.in_buf.lock().unwrap().len()
    }

    // While blocked, output is refused with WouldBlock.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Relaxed);
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Relaxed);
    }
}

impl SerialPort for PipeSerial {
    fn poll_input(&self) -> Result<Option<RxChar>, TransportError> {
        if self.disconnected.load(Ordering::Relaxed) {
            return Err(TransportError::Disconnected);
        }
        Ok(self.in_buf.lock().unwrap().pop_front())
    }

    fn try_output(&self, val: u8) -> Result<TxStatus, TransportError> {
        if self.disconnected.load(Ordering::Relaxed) {
            return Err(TransportError::Disconnected);
        }
        if self.blocked.load(Ordering::Relaxed) {
            return Ok(TxStatus::WouldBlock);
        }
        self.out_buf.lock().unwrap().push_back(val);
        Ok(TxStatus::Accepted)
    }
}

////////////////////////////////////////////////////////////////////////////////

// The controlling terminal, in raw mode for as long as this lives.
pub struct StdioSerial(());

impl StdioSerial {
    pub fn new() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(StdioSerial(()))
    }

    fn key_to_byte(code: KeyCode, modifiers: KeyModifiers) -> Option<u8> {
        match code {
            KeyCode::Char(c) if c.is_ascii() => {
                let val = c as u8;
                if modifiers.contains(KeyModifiers::CONTROL) {
                    Some(val & 0x1f)
                } else {
                    Some(val)
                }
            }
            KeyCode::Enter => Some(b'\r'),
            KeyCode::Tab => Some(b'\t'),
            KeyCode::Backspace => Some(0x7f),
            KeyCode::Esc => Some(0x1b),
            _ => None,
        }
    }
}

impl Drop for StdioSerial {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

impl SerialPort for StdioSerial {
    fn poll_input(&self) -> Result<Option<RxChar>, TransportError> {
        let ready = event::poll(Duration::ZERO).map_err(|_| TransportError::Disconnected)?;
        if !ready {
            return Ok(None);
        }
        let Event::Key(key) = event::read().map_err(|_| TransportError::Disconnected)? else {
            return Ok(None);
        };
        if key.kind != KeyEventKind::Press {
            return Ok(None);
        }
        // ^C leaves the session; ^\ sends a line break.
        match (key.code, key.modifiers.contains(KeyModifiers::CONTROL)) {
            (KeyCode::Char('c'), true) => Err(TransportError::Disconnected),
            (KeyCode::Char('\\'), true) => Ok(Some(RxChar::Break)),
            (code, _) => Ok(Self::key_to_byte(code, key.modifiers).map(RxChar::Byte)),
        }
    }

    fn try_output(&self, val: u8) -> Result<TxStatus, TransportError> {
        let mut out = stdout().lock();
        match out.write_all(&[val]).and_then(|_| out.flush()) {
            Ok(()) => Ok(TxStatus::Accepted),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(TxStatus::WouldBlock)
            }
            Err(_) => Err(TransportError::Disconnected),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Default, Clone, Copy)]
pub struct NullMirror();

impl Mirror for NullMirror {
    fn mirror(&self, _val: u8) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct PipeMirror {
    buf: Mutex<Vec<u8>>,
    failing: AtomicBool,
}

impl PipeMirror {
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.buf.lock().unwrap())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl Mirror for PipeMirror {
    fn mirror(&self, val: u8) -> io::Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "mirror closed"));
        }
        self.buf.lock().unwrap().push(val);
        Ok(())
    }
}

// Mirrors into any writer, e.g. a log file.
pub struct WriterMirror<W: Write + Send>(Mutex<W>);

impl<W: Write + Send> WriterMirror<W> {
    pub fn new(writer: W) -> Self {
        WriterMirror(Mutex::new(writer))
    }
}

impl<W: Write + Send> Mirror for WriterMirror<W> {
    fn mirror(&self, val: u8) -> io::Result<()> {
        let mut out = self.0.lock().unwrap();
        out.write_all(&[val])?;
        out.flush()
    }
}
