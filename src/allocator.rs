use std::collections::HashSet;
use std::net::TcpListener;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("no free local port in range {min}-{max}")]
    RangeExhausted { min: u16, max: u16 },
}

type PortProbe = Box<dyn Fn(u16) -> bool + Send + Sync>;

/// Picks the local port for a new tunnel.
///
/// Preference order: the remote port's own value (so remote 8080 appears as
/// local 8080 whenever possible), then the first free port scanning upward
/// from there, wrapping to the bottom of the range. Every candidate is
/// checked against our own bookkeeping and against a real bind probe, since
/// unrelated local processes occupy ports our registry knows nothing about.
pub struct PortAllocator {
    range: (u16, u16),
    probe: PortProbe,
}

impl PortAllocator {
    pub fn new(range: (u16, u16)) -> Self {
        Self {
            range,
            probe: Box::new(probe_bind),
        }
    }

    /// Replace the bind probe. Tests use this to make allocation
    /// deterministic regardless of what is bound on the host.
    pub fn with_probe(range: (u16, u16), probe: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        Self {
            range,
            probe: Box::new(probe),
        }
    }

    pub fn allocate(&self, desired: u16, in_use: &HashSet<u16>) -> Result<u16, AllocationError> {
        let (min, max) = self.range;
        let start = if (min..=max).contains(&desired) {
            desired
        } else {
            min
        };

        let candidates = (start..=max).chain(min..start);
        for port in candidates {
            if in_use.contains(&port) {
                continue;
            }
            if (self.probe)(port) {
                return Ok(port);
            }
        }

        Err(AllocationError::RangeExhausted { min, max })
    }
}

fn probe_bind(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
