use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Logical budget on simultaneously resident raw-data bytes.
///
/// Reservation and release are paired around each sample's lifetime; the
/// single lock makes check-and-reserve mutually exclusive, so two workers can
/// never both observe headroom and overcommit.
pub struct DiskQuotaGuard {
    ceiling_bytes: u64,
    reserved: Mutex<u64>,
    freed: Condvar,
}

impl DiskQuotaGuard {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self {
            ceiling_bytes,
            reserved: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }

    pub fn reserved_bytes(&self) -> u64 {
        *self.reserved.lock().expect("quota lock poisoned")
    }

    /// Non-blocking check-and-reserve.
    pub fn reserve(&self, bytes: u64) -> bool {
        let mut reserved = self.reserved.lock().expect("quota lock poisoned");
        if *reserved + bytes > self.ceiling_bytes {
            return false;
        }
        *reserved += bytes;
        true
    }

    /// Block until the reservation is granted or `cancel` is raised. Returns
    /// false only on cancellation; a footprint that can never fit must be
    /// rejected by the caller up front via [`DiskQuotaGuard::can_ever_fit`].
    pub fn reserve_blocking(&self, bytes: u64, cancel: &AtomicBool) -> bool {
        let mut reserved = self.reserved.lock().expect("quota lock poisoned");
        loop {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
            if *reserved + bytes <= self.ceiling_bytes {
                *reserved += bytes;
                return true;
            }
            let (guard, _timeout) = self
                .freed
                .wait_timeout(reserved, Duration::from_millis(200))
                .expect("quota lock poisoned");
            reserved = guard;
        }
    }

    pub fn can_ever_fit(&self, bytes: u64) -> bool {
        bytes <= self.ceiling_bytes
    }

    pub fn release(&self, bytes: u64) {
        let mut reserved = self.reserved.lock().expect("quota lock poisoned");
        *reserved = reserved.saturating_sub(bytes);
        drop(reserved);
        self.freed.notify_all();
    }
}
