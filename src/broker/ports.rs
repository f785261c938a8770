use std::{collections::HashSet, fmt, net::TcpListener};

use parking_lot::Mutex;

use super::error::{BrokerError, BrokerResult};

/// Half-open port interval `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Leases TCP ports out of the configured ranges.
///
/// A port counts as free when it has not been leased and a probe bind on it
/// succeeds. With no ranges configured the picker defers to OS ephemeral
/// assignment.
#[derive(Debug)]
pub struct PortPicker {
    inner: Mutex<PickerInner>,
}

#[derive(Debug)]
struct PickerInner {
    ranges: Vec<PortRange>,
    leased: HashSet<u16>,
}

impl PortPicker {
    /// Ranges must be non-empty intervals and must not overlap. The config
    /// loader rejects such input before a broker is built; this guard keeps
    /// the invariant for pickers constructed directly.
    pub fn new(mut ranges: Vec<PortRange>) -> BrokerResult<Self> {
        ranges.sort_by_key(|range| range.begin);
        for range in &ranges {
            if range.begin >= range.end {
                return Err(BrokerError::InvalidArgument(format!(
                    "port range {range} is empty"
                )));
            }
        }
        for pair in ranges.windows(2) {
            if pair[1].begin < pair[0].end {
                return Err(BrokerError::InvalidArgument(format!(
                    "port ranges {} and {} overlap",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(Self {
            inner: Mutex::new(PickerInner {
                ranges,
                leased: HashSet::new(),
            }),
        })
    }

    pub fn next(&self) -> BrokerResult<u16> {
        let mut inner = self.inner.lock();
        if inner.ranges.is_empty() {
            return allocate_ephemeral(&mut inner);
        }

        for range in inner.ranges.clone() {
            for port in range.begin..range.end {
                if inner.leased.contains(&port) {
                    continue;
                }
                if probe(port) {
                    inner.leased.insert(port);
                    return Ok(port);
                }
            }
        }
        Err(BrokerError::Aborted(
            "no free ports remain in the configured ranges".to_string(),
        ))
    }

    pub fn release(&self, port: u16) {
        self.inner.lock().leased.remove(&port);
    }

    pub fn release_all<I>(&self, ports: I)
    where
        I: IntoIterator<Item = u16>,
    {
        let mut inner = self.inner.lock();
        for port in ports {
            inner.leased.remove(&port);
        }
    }
}

fn allocate_ephemeral(inner: &mut PickerInner) -> BrokerResult<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(|error| {
        BrokerError::Aborted(format!("binding an ephemeral port failed: {error}"))
    })?;
    let port = listener
        .local_addr()
        .map_err(|error| BrokerError::Aborted(format!("reading bound address failed: {error}")))?
        .port();
    drop(listener);
    inner.leased.insert(port);
    Ok(port)
}

fn probe(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
