use common::access::Width;
use common::constants::{CELL_BYTES, UART_BASE};
use periph_lib::io::ServiceError;
use periph_lib::io::serial::{PipeMirror, PipeSerial, TransportError};
use periph_lib::io::uart::Uart;
use periph_lib::{BusError, Machine, Unit};

use std::sync::{Arc, Mutex};

const DATA: u64 = UART_BASE;
const IE: u64 = UART_BASE + CELL_BYTES;
const IID: u64 = UART_BASE + 2 * CELL_BYTES;
const FCTL: u64 = IID;
const LCTL: u64 = UART_BASE + 3 * CELL_BYTES;
const LSTA: u64 = UART_BASE + 5 * CELL_BYTES;
const MSTA: u64 = UART_BASE + 6 * CELL_BYTES;
const SCR: u64 = UART_BASE + 7 * CELL_BYTES;

const POLL: u64 = Uart::RX_POLL_TICKS;
const LCTL_8N1: u8 = 0x03;

fn setup() -> (Machine, Arc<PipeSerial>, Arc<Mutex<Uart>>) {
    let port = Arc::new(PipeSerial::default());
    let mut machine = Machine::new();
    let uart = machine.set_mmio_handler(Uart::new(UART_BASE, port.clone()));
    machine.write_byte(LCTL, LCTL_8N1).unwrap();
    (machine, port, uart)
}

fn send(machine: &mut Machine, val: u8) {
    machine.write_byte(DATA, val).unwrap();
    let sent = machine
        .run_until(1000, |m| m.read_byte(LSTA).unwrap() & Uart::LSTA_XEMP != 0)
        .unwrap();
    assert!(sent);
}

#[test]
fn receive_fifo_bounded_and_ordered() {
    let (mut machine, port, uart) = setup();
    port.write_input(&(0..20).collect::<Vec<u8>>());

    for _ in 0..20 {
        machine.run(POLL).unwrap();
        let (_, _, count) = uart.lock().unwrap().rx_pointers();
        assert!(count <= 16);
    }
    assert_eq!(port.input_len(), 0);
    assert_eq!(uart.lock().unwrap().rx_pointers().2, 16);

    let lsta = machine.read_byte(LSTA).unwrap();
    assert_ne!(lsta & Uart::LSTA_OE, 0);
    assert_ne!(lsta & Uart::LSTA_DRDY, 0);
    assert_eq!(lsta & Uart::LSTA_ERR, 0);

    // Error bits only report once.
    assert_eq!(machine.read_byte(LSTA).unwrap() & Uart::LSTA_OE, 0);

    for expected in 0..16u8 {
        assert_eq!(machine.read_byte(DATA).unwrap(), expected);
    }
    assert_eq!(machine.read_byte(LSTA).unwrap() & Uart::LSTA_DRDY, 0);
    assert_eq!(machine.read_byte(DATA).unwrap(), 0);
}

#[test]
fn alarm_at_threshold() {
    let (mut machine, port, uart) = setup();
    machine.write_byte(FCTL, Uart::FCTL_ENABLE | (0x2 << Uart::FCTL_TRIGGER_SHIFT)).unwrap();
    machine.write_byte(IE, Uart::IE_RX_ALARM).unwrap();
    assert_eq!(uart.lock().unwrap().rx_threshold(), 8);

    port.write_input(b"abcdefgh");
    machine.run(8 * POLL).unwrap();

    let state = uart.lock().unwrap();
    assert!(state.causes().rx_alarm);
    assert_eq!(state.rx_timeout(), 0);
    assert_eq!(state.interrupt_id(), Uart::IID_FIFO_BITS | 0x4);
    drop(state);
    assert!(machine.irq());

    // Draining below the threshold withdraws the alarm.
    machine.read_byte(DATA).unwrap();
    assert!(!uart.lock().unwrap().causes().rx_alarm);
    assert!(!machine.irq());
}

#[test]
fn timeout_below_threshold() {
    let (mut machine, port, uart) = setup();
    machine.write_byte(FCTL, Uart::FCTL_ENABLE | (0x2 << Uart::FCTL_TRIGGER_SHIFT)).unwrap();
    machine.write_byte(IE, Uart::IE_RX_ALARM).unwrap();

    port.write_input(b"abcdefg");
    machine.run(7 * POLL).unwrap();
    {
        let state = uart.lock().unwrap();
        assert!(!state.causes().rx_alarm);
        assert!(!state.causes().rx_timeout);
        assert_eq!(state.rx_timeout(), Uart::RX_TIMEOUT_POLLS);
    }
    assert!(!machine.irq());

    machine.run(Uart::RX_TIMEOUT_POLLS as u64 * POLL).unwrap();
    assert!(uart.lock().unwrap().causes().rx_timeout);
    assert_eq!(machine.read_byte(IID).unwrap(), Uart::IID_FIFO_BITS | 0xc);
    assert!(machine.irq());

    assert_eq!(machine.read_byte(DATA).unwrap(), b'a');
    assert!(!uart.lock().unwrap().causes().rx_timeout);
    assert_eq!(machine.read_byte(IID).unwrap(), Uart::IID_FIFO_BITS | Uart::IID_NONE);
}

#[test]
fn fifo_reset_clears_receive_pointers() {
    let (mut machine, port, uart) = setup();
    port.write_input(b"hello");
    machine.run(5 * POLL).unwrap();
    machine.read_byte(DATA).unwrap();
    machine.read_byte(DATA).unwrap();
    assert_eq!(uart.lock().unwrap().rx_pointers(), (5, 2, 3));

    machine.write_byte(FCTL, Uart::FCTL_ENABLE | Uart::FCTL_RX_RESET).unwrap();
    assert_eq!(uart.lock().unwrap().rx_pointers(), (0, 0, 0));
    assert_eq!(machine.read_byte(LSTA).unwrap() & Uart::LSTA_DRDY, 0);
}

#[test]
fn line_status_outranks_transmit() {
    let (mut machine, port, _uart) = setup();
    machine.write_byte(IE, 0xf).unwrap();
    // Transmit-empty is already pending from reset.
    assert_eq!(machine.read_byte(IID).unwrap(), Uart::IID_FIFO_BITS | 0x2);

    port.push_break();
    machine.run(POLL).unwrap();
    assert_eq!(machine.read_byte(IID).unwrap(), Uart::IID_FIFO_BITS | 0x6);

    let lsta = machine.read_byte(LSTA).unwrap();
    assert_eq!(
        lsta,
        Uart::LSTA_BI | Uart::LSTA_DRDY | Uart::LSTA_FEMP | Uart::LSTA_XEMP | Uart::LSTA_ERR
    );
    assert_eq!(machine.read_byte(IID).unwrap(), Uart::IID_FIFO_BITS | 0x4);

    assert_eq!(machine.read_byte(DATA).unwrap(), 0);
    assert_eq!(machine.read_byte(IID).unwrap(), Uart::IID_FIFO_BITS | 0x2);
    assert!(machine.irq());

    machine.write_byte(IE, 0).unwrap();
    assert_eq!(machine.read_byte(IID).unwrap(), Uart::IID_FIFO_BITS | Uart::IID_NONE);
    assert!(!machine.irq());
}

#[test]
fn divisor_latch() {
    let (mut machine, _port, uart) = setup();
    machine.write_byte(IE, Uart::IE_TX_EMPTY).unwrap();

    machine.write_byte(LCTL, Uart::LCTL_DLAB | LCTL_8N1).unwrap();
    machine.write_byte(DATA, 0x0c).unwrap();
    machine.write_byte(IE, 0x01).unwrap();
    assert_eq!(machine.read_byte(DATA).unwrap(), 0x0c);
    assert_eq!(machine.read_byte(IE).unwrap(), 0x01);
    assert_eq!(uart.lock().unwrap().divisor(), 0x010c);
    assert!(!uart.lock().unwrap().is_xmit_full());

    machine.write_byte(LCTL, LCTL_8N1).unwrap();
    assert_eq!(machine.read_byte(IE).unwrap(), Uart::IE_TX_EMPTY);
    machine.write_byte(IE, 0x05).unwrap();
    assert_eq!(machine.read_byte(IE).unwrap(), 0x05);

    machine.write_byte(LCTL, Uart::LCTL_DLAB | LCTL_8N1).unwrap();
    assert_eq!(machine.read_byte(DATA).unwrap(), 0x0c);
    assert_eq!(machine.read_byte(IE).unwrap(), 0x01);
    assert_eq!(machine.read_byte(LCTL).unwrap(), Uart::LCTL_DLAB | LCTL_8N1);
}

#[test]
fn odd_parity_on_transmit() {
    let (mut machine, port, _uart) = setup();
    machine.write_byte(LCTL, LCTL_8N1 | Uart::LCTL_PEN).unwrap();
    send(&mut machine, 0x41);
    let out = port.take_output();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0] & 0x7f, 0x41);
    assert_eq!(out[0].count_ones() % 2, 1);
}

#[test]
fn parity_error_on_receive() {
    let (mut machine, port, _uart) = setup();
    machine.write_byte(LCTL, LCTL_8N1 | Uart::LCTL_PEN).unwrap();
    machine.write_byte(IE, Uart::IE_LINE_STATUS).unwrap();

    // Odd parity wants bit 7 set for 'A'.
    port.push_input(0x41);
    machine.run(POLL).unwrap();
    assert_eq!(machine.read_byte(IID).unwrap(), Uart::IID_FIFO_BITS | 0x6);
    let lsta = machine.read_byte(LSTA).unwrap();
    assert_ne!(lsta & Uart::LSTA_PE, 0);
    assert_ne!(lsta & Uart::LSTA_ERR, 0);
    assert_eq!(machine.read_byte(DATA).unwrap(), 0x41);

    port.push_input(0xc1);
    machine.run(POLL).unwrap();
    assert_eq!(machine.read_byte(LSTA).unwrap() & (Uart::LSTA_PE | Uart::LSTA_ERR), 0);
    assert_eq!(machine.read_byte(DATA).unwrap(), 0x41);
}

#[test]
fn seven_bit_receive() {
    let (mut machine, port, _uart) = setup();
    machine.write_byte(LCTL, 0x02).unwrap();
    port.push_input(0xc1);
    machine.run(POLL).unwrap();
    assert_eq!(machine.read_byte(DATA).unwrap(), 0x41);
}

#[test]
fn transmit_in_order() {
    let (mut machine, port, uart) = setup();
    machine.write_byte(IE, Uart::IE_TX_EMPTY).unwrap();

    for &ch in b"abc" {
        machine.write_byte(DATA, ch).unwrap();
        assert!(!uart.lock().unwrap().causes().tx_empty);
        machine.run(Uart::FIFO_DELAY_TICKS).unwrap();
    }
    assert!(!machine.irq());
    assert_eq!(machine.read_byte(LSTA).unwrap() & Uart::LSTA_FEMP, 0);

    machine.run(10 * Uart::TX_DELAY_TICKS).unwrap();
    assert_eq!(port.take_output(), b"abc");
    assert!(uart.lock().unwrap().causes().tx_empty);
    assert!(machine.irq());
    let lsta = machine.read_byte(LSTA).unwrap();
    assert_eq!(lsta & (Uart::LSTA_FEMP | Uart::LSTA_XEMP), Uart::LSTA_FEMP | Uart::LSTA_XEMP);
}

#[test]
fn would_block_keeps_byte() {
    let (mut machine, port, uart) = setup();
    port.set_blocked(true);
    machine.write_byte(DATA, b'x').unwrap();
    machine.run(10 * Uart::TX_DELAY_TICKS).unwrap();
    assert!(port.is_out_empty());
    assert_eq!(uart.lock().unwrap().tx_pointers().2, 1);
    assert_eq!(machine.read_byte(LSTA).unwrap() & Uart::LSTA_FEMP, 0);

    port.set_blocked(false);
    machine.run(2 * Uart::TX_DELAY_TICKS).unwrap();
    assert_eq!(port.pop_output(), Some(b'x'));
    assert_eq!(uart.lock().unwrap().tx_pointers().2, 0);
}

#[test]
fn disconnect_reported_to_caller() {
    let (mut machine, port, uart) = setup();
    port.write_input(b"q");
    machine.run(POLL).unwrap();
    port.disconnect();

    let res = machine.run(POLL);
    assert!(matches!(
        res,
        Err(BusError::Service {
            unit: Unit::UartRx,
            source: ServiceError::Transport(TransportError::Disconnected),
            ..
        })
    ));
    assert_eq!(uart.lock().unwrap().rx_pointers().2, 1);
    assert_eq!(machine.read_byte(DATA).unwrap(), b'q');
}

#[test]
fn mirror_failures_ignored() {
    let port = Arc::new(PipeSerial::default());
    let mirror = Arc::new(PipeMirror::default());
    let mut machine = Machine::new();
    machine.set_mmio_handler(Uart::with_mirror(UART_BASE, port.clone(), mirror.clone()));
    machine.write_byte(LCTL, LCTL_8N1).unwrap();

    send(&mut machine, b'm');
    assert_eq!(mirror.take(), b"m");

    mirror.set_failing(true);
    send(&mut machine, b'n');
    assert!(mirror.take().is_empty());
    assert_eq!(port.take_output(), b"mn");
}

#[test]
fn wide_accesses() {
    let (mut machine, _port, _uart) = setup();
    machine.write(LCTL, Width::Quad, 0xdead_beef_0000_0007).unwrap();
    assert_eq!(machine.read(LCTL, Width::Quad).unwrap(), 0x07);
    assert_eq!(machine.read(LCTL, Width::Long).unwrap(), 0x07);

    machine.write(SCR, Width::Word, 0x1234).unwrap();
    assert_eq!(machine.read_byte(SCR).unwrap(), 0x34);

    assert!(machine.write(SCR + 4, Width::Long, 0).is_err());
    assert_eq!(machine.read_byte(SCR).unwrap(), 0x34);
}

#[test]
fn modem_status_fixed() {
    let (mut machine, _port, _uart) = setup();
    assert_eq!(machine.read_byte(MSTA).unwrap(), Uart::MSTA_FIXED);
    machine.write_byte(MSTA, 0).unwrap();
    assert_eq!(machine.read_byte(MSTA).unwrap(), Uart::MSTA_FIXED);
}

#[test]
fn transmit_reset_keeps_hold_byte() {
    let (mut machine, port, uart) = setup();
    port.set_blocked(true);
    for val in 0..16 {
        machine.write_byte(DATA, val).unwrap();
        machine.run(Uart::FIFO_DELAY_TICKS).unwrap();
    }
    // The FIFO is full, so this one stays in the hold register.
    machine.write_byte(DATA, 0x10).unwrap();
    machine.run(Uart::FIFO_DELAY_TICKS).unwrap();
    assert!(uart.lock().unwrap().is_xmit_full());
    assert_eq!(uart.lock().unwrap().tx_pointers().2, 16);

    machine.write_byte(FCTL, Uart::FCTL_ENABLE | Uart::FCTL_TX_RESET).unwrap();
    assert_eq!(uart.lock().unwrap().tx_pointers(), (0, 0, 0));
    assert_eq!(machine.read_byte(LSTA).unwrap() & Uart::LSTA_XEMP, 0);

    port.set_blocked(false);
    let sent = machine
        .run_until(1000, |m| m.read_byte(LSTA).unwrap() & Uart::LSTA_XEMP != 0)
        .unwrap();
    assert!(sent);
    assert_eq!(port.take_output(), [0x10]);
    let state = uart.lock().unwrap();
    assert!(!state.is_xmit_full());
    assert!(state.causes().tx_empty);
}

#[test]
fn transmit_reset_with_empty_hold_raises_cause() {
    let (mut machine, port, uart) = setup();
    port.set_blocked(true);
    machine.write_byte(IE, Uart::IE_TX_EMPTY).unwrap();
    machine.write_byte(DATA, b'a').unwrap();
    machine.run(Uart::FIFO_DELAY_TICKS).unwrap();
    assert!(!machine.irq());

    machine.write_byte(FCTL, Uart::FCTL_ENABLE | Uart::FCTL_TX_RESET).unwrap();
    assert!(machine.irq());
    assert_eq!(machine.read_byte(IID).unwrap(), Uart::IID_FIFO_BITS | 0x2);

    port.set_blocked(false);
    machine.run(10 * Uart::TX_DELAY_TICKS).unwrap();
    assert!(port.is_out_empty());
    assert_eq!(machine.pending_events(), 1);
}
