//! Serial port driver for debug output
//!
//! UART 16550 on COM1, the sink for all kernel log output. Hosted test
//! builds print to stderr instead; other architectures discard.

#[cfg(all(target_arch = "x86_64", not(test)))]
mod imp {
    use core::fmt;
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    /// Standard COM1 port address
    const SERIAL_IO_PORT: u16 = 0x3F8;

    lazy_static! {
        /// Global serial port instance protected by spinlock
        pub static ref SERIAL1: Mutex<SerialPort> = {
            let mut serial_port = unsafe { SerialPort::new(SERIAL_IO_PORT) };
            serial_port.init();
            Mutex::new(serial_port)
        };
    }

    #[doc(hidden)]
    pub fn _print(args: fmt::Arguments) {
        use crate::arch;
        use core::fmt::Write;

        // Disable interrupts to prevent deadlock on the port lock
        let ints = arch::int_disable();
        let _ = SERIAL1.lock().write_fmt(args);
        arch::int_restore(ints);
    }
}


#[cfg(all(not(target_arch = "x86_64"), not(test)))]
mod imp {
    use core::fmt;

    #[doc(hidden)]
    pub fn _print(_args: fmt::Arguments) {}
}

pub use imp::_print;

/// Initialize serial output. Lazy on first use; forcing it here keeps boot
/// messages ordered.
pub fn init() {
    _print(format_args!(""));
}

/// Print to serial port
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Print to serial port with newline
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*
    ));
}
