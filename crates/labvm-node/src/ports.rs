use std::collections::HashSet;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::{Mutex, PoisonError};

/// Returns true when nothing on the host is bound to the port.
pub type PortCheck = fn(u16) -> bool;

/// Hands out display ports from a fixed range.
///
/// A port is reserved under the lock before the allocator returns it, so two
/// concurrent creates can never receive the same port even though neither
/// has defined its domain yet. Ports of defined-but-stopped VMs are not bound
/// on the host, which is why the allocator must be seeded with every port
/// recorded in the store on startup.
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    reserved: Mutex<HashSet<u16>>,
    is_free: PortCheck,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self::with_free_check(range, port_is_free)
    }

    pub fn with_free_check(range: RangeInclusive<u16>, is_free: PortCheck) -> Self {
        Self {
            range,
            reserved: Mutex::new(HashSet::new()),
            is_free,
        }
    }

    /// Reserve the first port that is neither reserved nor bound on the host.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        for port in self.range.clone() {
            if !reserved.contains(&port) && (self.is_free)(port) {
                reserved.insert(port);
                return Ok(port);
            }
        }
        Err(PortError::Exhausted {
            min: *self.range.start(),
            max: *self.range.end(),
        })
    }

    /// Mark a port as taken by an existing VM. Returns false if it was
    /// already reserved.
    pub fn reserve(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port)
    }

    /// Return a port to the pool.
    pub fn release(&self, port: u16) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Check a port by binding it on every interface, the address the
/// hypervisor's display channel listens on.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[derive(Debug)]
pub enum PortError {
    Exhausted { min: u16, max: u16 },
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortError::Exhausted { min, max } => {
                write!(f, "no free display port in {}-{}", min, max)
            }
        }
    }
}

impl std::error::Error for PortError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn always_free(_: u16) -> bool {
        true
    }

    fn odd_ports_busy(port: u16) -> bool {
        port % 2 == 0
    }

    #[test]
    fn allocate_returns_first_free_port() {
        let ports = PortAllocator::with_free_check(5900..=5999, always_free);
        assert_eq!(ports.allocate().unwrap(), 5900);
        assert_eq!(ports.allocate().unwrap(), 5901);
        assert_eq!(ports.reserved_count(), 2);
    }

    #[test]
    fn allocate_skips_ports_bound_on_host() {
        let ports = PortAllocator::with_free_check(5901..=5905, odd_ports_busy);
        assert_eq!(ports.allocate().unwrap(), 5902);
        assert_eq!(ports.allocate().unwrap(), 5904);
        assert!(matches!(ports.allocate(), Err(PortError::Exhausted { .. })));
    }

    #[test]
    fn seeded_ports_are_skipped() {
        let ports = PortAllocator::with_free_check(5900..=5999, always_free);
        assert!(ports.reserve(5900));
        assert!(!ports.reserve(5900));
        assert_eq!(ports.allocate().unwrap(), 5901);
    }

    #[test]
    fn release_makes_port_reusable() {
        let ports = PortAllocator::with_free_check(5900..=5999, always_free);
        let p0 = ports.allocate().unwrap();
        let _p1 = ports.allocate().unwrap();
        ports.release(p0);
        assert_eq!(ports.allocate().unwrap(), p0);
    }

    #[test]
    fn exhaustion_returns_error() {
        let ports = PortAllocator::with_free_check(5900..=5903, always_free);
        for _ in 0..4 {
            ports.allocate().unwrap();
        }
        let err = ports.allocate().unwrap_err();
        assert_eq!(err.to_string(), "no free display port in 5900-5903");
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let ports = Arc::new(PortAllocator::with_free_check(5900..=5999, always_free));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || ports.allocate().unwrap())
            })
            .collect();

        let mut got: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        got.sort_unstable();
        got.dedup();
        assert_eq!(got.len(), 32);
        assert!(got.iter().all(|p| (5900..=5999).contains(p)));
    }

    #[test]
    fn bound_port_is_reported_busy() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_is_free(port));
    }
}
