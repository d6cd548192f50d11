//! COM1 diagnostics.

use core::fmt;

#[cfg(not(test))]
use uart_16550::SerialPort;

#[cfg(not(test))]
use crate::{config::SERIAL_PORT, sync::IrqMutex};

#[cfg(not(test))]
pub static SERIAL: IrqMutex<SerialPort> = IrqMutex::new(unsafe { SerialPort::new(SERIAL_PORT) });

#[cfg(not(test))]
pub fn init() {
    SERIAL.lock().init();
}

#[cfg(test)]
pub fn init() {}

#[doc(hidden)]
#[cfg(not(test))]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = SERIAL.lock().write_fmt(args);
}

#[doc(hidden)]
#[cfg(test)]
pub fn _print(args: fmt::Arguments) {
    std::print!("{}", args);
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// Reports and halts. Never returns.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::serial::halt_with(format_args!($($arg)*))
    };
}

#[doc(hidden)]
pub fn halt_with(args: fmt::Arguments) -> ! {
    _print(format_args!("FATAL: {}\n", args));
    crate::arch::halt_loop()
}
