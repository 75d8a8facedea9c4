use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use rand::Rng;

/// OUI reserved for QEMU/KVM guests.
const MAC_PREFIX: &str = "52:54:00";

/// Give up after this many colliding draws (the space has 2^24 addresses).
const MAX_MAC_ATTEMPTS: usize = 64;

/// Format a guest MAC address from its three random low octets.
fn format_mac(octets: [u8; 3]) -> String {
    format!(
        "{}:{:02x}:{:02x}:{:02x}",
        MAC_PREFIX, octets[0], octets[1], octets[2]
    )
}

/// Tracks MAC addresses of defined VMs so a new VM never reuses one.
pub struct MacAllocator {
    used: Mutex<HashSet<String>>,
}

impl Default for MacAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MacAllocator {
    pub fn new() -> Self {
        Self {
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Draw a random `52:54:00:xx:xx:xx` address not held by any other VM.
    pub fn allocate(&self) -> Result<String, MacError> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_MAC_ATTEMPTS {
            let mac = format_mac(rng.gen());
            if used.insert(mac.clone()) {
                return Ok(mac);
            }
        }
        Err(MacError::Exhausted)
    }

    /// Record the MAC of an existing VM.
    pub fn reserve(&self, mac: &str) -> bool {
        self.used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(mac.to_ascii_lowercase())
    }

    pub fn release(&self, mac: &str) {
        self.used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&mac.to_ascii_lowercase());
    }

    pub fn active_count(&self) -> usize {
        self.used.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// True for addresses of the form produced by [`MacAllocator::allocate`].
pub fn is_guest_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    mac.to_ascii_lowercase().starts_with(MAC_PREFIX)
        && parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

#[derive(Debug)]
pub enum MacError {
    Exhausted,
}

impl std::fmt::Display for MacError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MacError::Exhausted => write!(
                f,
                "could not find an unused MAC address after {} attempts",
                MAX_MAC_ATTEMPTS
            ),
        }
    }
}

impl std::error::Error for MacError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_mac_zero() {
        assert_eq!(format_mac([0, 0, 0]), "52:54:00:00:00:00");
    }

    #[test]
    fn format_mac_lowercase_hex() {
        assert_eq!(format_mac([0xab, 0x0c, 0xff]), "52:54:00:ab:0c:ff");
    }

    #[test]
    fn allocated_macs_use_kvm_prefix() {
        let macs = MacAllocator::new();
        let mac = macs.allocate().unwrap();
        assert!(is_guest_mac(&mac), "unexpected mac {}", mac);
        assert_eq!(macs.active_count(), 1);
    }

    #[test]
    fn allocated_macs_are_unique() {
        let macs = MacAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            assert!(seen.insert(macs.allocate().unwrap()));
        }
    }

    #[test]
    fn reserve_is_case_insensitive() {
        let macs = MacAllocator::new();
        assert!(macs.reserve("52:54:00:AB:CD:EF"));
        assert!(!macs.reserve("52:54:00:ab:cd:ef"));
        macs.release("52:54:00:Ab:Cd:Ef");
        assert_eq!(macs.active_count(), 0);
    }

    #[test]
    fn guest_mac_shape() {
        assert!(is_guest_mac("52:54:00:01:02:03"));
        assert!(!is_guest_mac("AA:FC:00:00:00:01"));
        assert!(!is_guest_mac("52:54:00:01:02"));
        assert!(!is_guest_mac("52:54:00:01:02:zz"));
    }
}
