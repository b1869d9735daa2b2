//! Host ports: the handful of primitives the core needs from whatever
//! platform embeds it.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// The platform surface the VM runs against.
pub trait Host: std::fmt::Debug {
    /// Milliseconds since an arbitrary fixed epoch.
    fn current_time_millis(&self) -> u64;

    /// A pseudo-random value for seeding.
    fn random_int(&self) -> i32;

    /// Write one byte of program output.
    fn write_byte(&self, byte: u8);

    /// Idle for up to `millis` while no thread is runnable.
    fn idle(&self, millis: u64);

    /// Begin a host critical section (a no-op unless asynchronous
    /// native functions are enabled).
    fn enter_critical_section(&self) {}

    /// End a host critical section.
    fn exit_critical_section(&self) {}
}

/// The default host: system clock, OS entropy, stdout.
#[derive(Debug, Default)]
pub struct SystemHost;

impl Host for SystemHost {
    fn current_time_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    fn random_int(&self) -> i32 {
        let mut bytes = [0u8; 4];
        if getrandom::getrandom(&mut bytes).is_err() {
            // Entropy failure degrades to a clock-derived value.
            return self.current_time_millis() as i32 | 1;
        }
        i32::from_le_bytes(bytes)
    }

    fn write_byte(&self, byte: u8) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&[byte]);
        if byte == b'\n' {
            let _ = stdout.flush();
        }
    }

    fn idle(&self, millis: u64) {
        std::thread::sleep(std::time::Duration::from_millis(millis.min(50)));
    }
}

/// A deterministic host for tests: virtual clock, captured output,
/// fixed entropy. Idling advances the clock instead of sleeping, so
/// alarm-driven scenarios run instantly.
#[derive(Debug)]
pub struct CaptureHost {
    clock: Cell<u64>,
    output: RefCell<Vec<u8>>,
    seed: Cell<u32>,
}

impl Default for CaptureHost {
    fn default() -> Self {
        CaptureHost {
            clock: Cell::new(1_000),
            output: RefCell::new(Vec::new()),
            seed: Cell::new(0x9E37_79B9),
        }
    }
}

impl CaptureHost {
    #[must_use]
    pub fn new() -> Self {
        CaptureHost::default()
    }

    /// Everything the program wrote, as a lossy string.
    #[must_use]
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.borrow()).to_string()
    }

    /// Advance the virtual clock.
    pub fn advance(&self, millis: u64) {
        self.clock.set(self.clock.get() + millis);
    }
}

impl Host for CaptureHost {
    fn current_time_millis(&self) -> u64 {
        self.clock.get()
    }

    fn random_int(&self) -> i32 {
        let next = self
            .seed
            .get()
            .wrapping_mul(1_103_515_245)
            .wrapping_add(12_345);
        self.seed.set(next);
        next as i32
    }

    fn write_byte(&self, byte: u8) {
        self.output.borrow_mut().push(byte);
    }

    fn idle(&self, millis: u64) {
        self.advance(millis.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_host_clock_and_output() {
        let host = CaptureHost::new();
        let start = host.current_time_millis();
        host.idle(25);
        assert_eq!(host.current_time_millis(), start + 25);
        for byte in b"ok" {
            host.write_byte(*byte);
        }
        assert_eq!(host.output(), "ok");
    }

    #[test]
    fn test_system_host_clock_moves_forward() {
        let host = SystemHost;
        assert!(host.current_time_millis() > 0);
    }
}
