use periph_lib::io::ServiceError;
use periph_lib::io::i2c::I2cController;
use periph_lib::io::serial::{Mirror, NullMirror, StdioSerial, TransportError, WriterMirror};
use periph_lib::io::spd::SpdDevice;
use periph_lib::io::uart::Uart;
use periph_lib::{BusError, Machine};

use common::constants::{CELL_BYTES, I2C_BASE, SPD_SIZE, UART_BASE};

use std::error::Error;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::info;

/// UART and SPD EEPROM peripheral emulator
#[derive(Parser)]
#[command(about)]
struct Args {
    /// SPD EEPROM images, attached to consecutive slots.
    #[arg(long = "spd")]
    spd: Vec<PathBuf>,

    /// Write-protect the lower half of every SPD.
    #[arg(long)]
    write_protect: bool,

    /// Read every SPD back through the I2C controller and hex dump it.
    #[arg(long)]
    dump: bool,

    /// Wire the UART to this terminal and echo what's typed.
    #[arg(long)]
    echo: bool,

    /// Copy everything the UART sends to this file.
    #[arg(long)]
    mirror: Option<PathBuf>,

    /// Stop the echo session after this many ticks (0 runs until ^C).
    #[arg(long, default_value_t = 0)]
    ticks: u64,
}

const I2C_TXR: u64 = I2C_BASE + 3 * CELL_BYTES;
const I2C_CR: u64 = I2C_BASE + 4 * CELL_BYTES;

const UART_DATA: u64 = UART_BASE;
const UART_FCTL: u64 = UART_BASE + 2 * CELL_BYTES;
const UART_LCTL: u64 = UART_BASE + 3 * CELL_BYTES;
const UART_LSTA: u64 = UART_BASE + 5 * CELL_BYTES;

const TRANSFER_LIMIT_TICKS: u64 = 10 * I2cController::PHASE_DELAY_TICKS;

fn i2c_command(machine: &mut Machine, cmd: u8) -> Result<(), Box<dyn Error>> {
    machine.write_byte(I2C_CR, cmd)?;
    let done = machine.run_until(TRANSFER_LIMIT_TICKS, |m| {
        m.read_byte(I2C_CR).map_or(true, |sr| sr & I2cController::SR_TIP == 0)
    })?;
    if !done {
        return Err("I2C transfer timed out".into());
    }
    Ok(())
}

fn read_spd(machine: &mut Machine, dev: usize) -> Result<Vec<u8>, Box<dyn Error>> {
    // Point the EEPROM at 0 with a write transfer, then restart as a read.
    machine.write_byte(I2C_TXR, I2cController::slave_address(dev, false))?;
    i2c_command(machine, I2cController::CMD_STA | I2cController::CMD_WR)?;
    machine.write_byte(I2C_TXR, 0)?;
    i2c_command(machine, I2cController::CMD_WR)?;

    machine.write_byte(I2C_TXR, I2cController::slave_address(dev, true))?;
    i2c_command(machine, I2cController::CMD_STA | I2cController::CMD_WR)?;

    let mut data = Vec::with_capacity(SPD_SIZE);
    for i in 0..SPD_SIZE {
        let nack = if i == SPD_SIZE - 1 { I2cController::CMD_NACK } else { 0 };
        i2c_command(machine, I2cController::CMD_RD | nack)?;
        data.push(machine.read_byte(I2C_TXR)?);
    }
    machine.write_byte(I2C_CR, I2cController::CMD_STO)?;
    Ok(data)
}

fn hex_dump(data: &[u8]) {
    for (row, chunk) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        println!("{:04x}: {}", row * 16, bytes.join(" "));
    }
}

fn echo(machine: &mut Machine, ticks: u64) -> Result<(), Box<dyn Error>> {
    // 8N1, FIFOs on and cleared, alarm at one byte.
    machine.write_byte(UART_LCTL, 0x03)?;
    machine.write_byte(UART_FCTL, Uart::FCTL_ENABLE | Uart::FCTL_RX_RESET | Uart::FCTL_TX_RESET)?;

    let mut elapsed = 0;
    while ticks == 0 || elapsed < ticks {
        match machine.step() {
            Err(BusError::Service { source: ServiceError::Transport(TransportError::Disconnected), .. }) => break,
            res => res?,
        }
        elapsed += 1;

        let lsta = machine.read_byte(UART_LSTA)?;
        if lsta & Uart::LSTA_DRDY != 0 && lsta & Uart::LSTA_XEMP != 0 {
            let ch = machine.read_byte(UART_DATA)?;
            machine.write_byte(UART_DATA, ch)?;
        }
        thread::sleep(Duration::from_micros(20));
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let opt = Args::parse();

    let mut devices = Vec::new();
    for path in opt.spd.iter() {
        let mut dev = SpdDevice::from_image(&std::fs::read(path)?);
        dev.set_write_protected(opt.write_protect);
        devices.push(dev);
    }

    let mut machine = Machine::new();
    let i2c = machine.set_mmio_handler(I2cController::with_devices(I2C_BASE, devices));
    let num_devices = i2c.lock().unwrap().num_devices();
    info!("{num_devices} SPD device(s) attached");

    if opt.dump {
        for dev in 0..num_devices {
            println!("SPD {dev}:");
            hex_dump(&read_spd(&mut machine, dev)?);
        }
    }

    if opt.echo {
        let mirror: Arc<dyn Mirror> = match &opt.mirror {
            Some(path) => Arc::new(WriterMirror::new(File::create(path)?)),
            None => Arc::new(NullMirror()),
        };
        let port = Arc::new(StdioSerial::new()?);
        machine.set_mmio_handler(Uart::with_mirror(UART_BASE, port, mirror));
        echo(&mut machine, opt.ticks)?;
    }

    Ok(())
}
