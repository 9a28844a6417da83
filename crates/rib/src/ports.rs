use std::{collections::BTreeMap, fmt, str::FromStr};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Inclusive range of listener ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start <= end);

        Self { start, end }
    }

    pub fn size(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 49152,
            end: 65535,
        }
    }
}

impl From<std::ops::RangeInclusive<u16>> for PortRange {
    fn from(range: std::ops::RangeInclusive<u16>) -> Self {
        Self::new(*range.start(), *range.end())
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug)]
pub struct PortRangeParseError(String);

impl std::error::Error for PortRangeParseError {}

impl fmt::Display for PortRangeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<std::num::ParseIntError> for PortRangeParseError {
    fn from(error: std::num::ParseIntError) -> Self {
        PortRangeParseError(error.to_string())
    }
}

impl FromStr for PortRange {
    type Err = PortRangeParseError;

    /// Parses `"10000..10100"`, or a bare `"10000"` as a single-port range.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = match s.split_once("..") {
            Some((start, end)) => (start.parse()?, end.parse()?),
            None => {
                let port = s.parse()?;
                (port, port)
            }
        };

        if start > end {
            return Err(PortRangeParseError(s.to_string()));
        }

        Ok(Self { start, end })
    }
}

impl Serialize for PortRange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Port(u16),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Port(port) => Ok(Self::new(port, port)),
            Repr::Text(s) => Self::from_str(&s).map_err(|e| serde::de::Error::custom(e.0)),
        }
    }
}

/// Scoped listener port allocator.
///
/// Every allocation is owned by a string key; asking again with the same key
/// returns the same port for as long as it stays allocated. Ports are handed
/// out in ascending order starting from the first configured range, and a
/// released port becomes the lowest candidate again. Exhaustion is not an
/// error condition: `allocate` returns `None` and the caller decides whether
/// to proceed without a listener.
pub struct PortAllocator {
    ranges: Vec<PortRange>,
    // One bit per allocatable slot across all ranges, high = taken. Bit 0 of
    // a bucket is the most significant bit, so `leading_ones` is the index of
    // the first free slot in the bucket.
    buckets: Vec<u64>,
    capacity: usize,
    by_key: AHashMap<String, u16>,
    by_port: AHashMap<u16, String>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(vec![PortRange::default()])
    }
}

impl PortAllocator {
    pub fn new(ranges: Vec<PortRange>) -> Self {
        let capacity = ranges.iter().map(|r| r.size()).sum::<usize>();
        let bucket_count = capacity.div_ceil(64).max(1);
        let mut buckets = vec![0u64; bucket_count];

        // Mark the tail bits past the last valid slot as taken so the scan
        // never walks off the end of the port space.
        for slot in capacity..bucket_count * 64 {
            buckets[slot / 64] |= 1 << (63 - (slot % 64));
        }

        Self {
            ranges,
            buckets,
            capacity,
            by_key: AHashMap::new(),
            by_port: AHashMap::new(),
        }
    }

    /// Total number of allocatable ports.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of ports currently bound to a key.
    pub fn allocated(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Binds the lowest free port to `key`, or returns the port already bound
    /// to it. `None` means the pool is exhausted.
    pub fn allocate(&mut self, key: &str) -> Option<u16> {
        if let Some(port) = self.by_key.get(key) {
            return Some(*port);
        }

        let slot = self.first_free_slot()?;
        self.buckets[slot / 64] |= 1 << (63 - (slot % 64));

        let port = self.port_at(slot);
        self.by_key.insert(key.to_string(), port);
        self.by_port.insert(port, key.to_string());
        Some(port)
    }

    /// Returns the port bound to `key` to the free pool. Unknown keys are
    /// silently accepted.
    pub fn release(&mut self, key: &str) {
        if let Some(port) = self.by_key.remove(key) {
            self.by_port.remove(&port);

            let slot = self.slot_of(port);
            self.buckets[slot / 64] &= !(1 << (63 - (slot % 64)));
        }
    }

    pub fn port_of(&self, key: &str) -> Option<u16> {
        self.by_key.get(key).copied()
    }

    pub fn key_of(&self, port: u16) -> Option<&str> {
        self.by_port.get(&port).map(|k| k.as_str())
    }

    /// Snapshot of every binding, ordered by key.
    pub fn allocations(&self) -> BTreeMap<String, u16> {
        self.by_key
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    fn first_free_slot(&self) -> Option<usize> {
        for (offset, bucket) in self.buckets.iter().enumerate() {
            if *bucket < u64::MAX {
                return Some(offset * 64 + bucket.leading_ones() as usize);
            }
        }

        None
    }

    fn port_at(&self, mut slot: usize) -> u16 {
        for range in &self.ranges {
            if slot < range.size() {
                return range.start + slot as u16;
            }

            slot -= range.size();
        }

        unreachable!("slot {slot} out of range");
    }

    fn slot_of(&self, port: u16) -> usize {
        let mut base = 0;
        for range in &self.ranges {
            if range.contains(port) {
                return base + (port - range.start) as usize;
            }

            base += range.size();
        }

        unreachable!("port {port} outside configured ranges");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges_and_bare_ports() {
        assert_eq!("10000..10100".parse::<PortRange>().unwrap(), PortRange::new(10000, 10100));
        assert_eq!("10000".parse::<PortRange>().unwrap(), PortRange::new(10000, 10000));
        assert!("10100..10000".parse::<PortRange>().is_err());
        assert!("ports".parse::<PortRange>().is_err());

        let range: PortRange = serde_json::from_str("\"10000..10100\"").unwrap();
        assert_eq!(range, PortRange::new(10000, 10100));
        let range: PortRange = serde_json::from_str("10000").unwrap();
        assert_eq!(range, PortRange::new(10000, 10000));
        assert_eq!(serde_json::to_string(&range).unwrap(), "\"10000..10000\"");
    }

    #[test]
    fn allocates_ascending_and_idempotent() {
        let mut pool = PortAllocator::new(vec![PortRange::new(10000, 10100)]);

        assert_eq!(pool.allocate("a"), Some(10000));
        assert_eq!(pool.allocate("b"), Some(10001));
        assert_eq!(pool.allocate("a"), Some(10000));
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.key_of(10001), Some("b"));
    }

    #[test]
    fn released_ports_are_reused_lowest_first() {
        let mut pool = PortAllocator::new(vec![PortRange::new(10000, 10100)]);

        for key in ["a", "b", "c"] {
            pool.allocate(key).unwrap();
        }

        pool.release("a");
        pool.release("b");
        pool.release("unknown-key");

        assert_eq!(pool.allocate("d"), Some(10000));
        assert_eq!(pool.allocate("e"), Some(10001));
        assert_eq!(pool.allocate("f"), Some(10003));
    }

    #[test]
    fn spills_into_the_next_range() {
        let mut pool = PortAllocator::new(vec![PortRange::new(10000, 10001), PortRange::new(20000, 20000)]);

        assert_eq!(pool.allocate("a"), Some(10000));
        assert_eq!(pool.allocate("b"), Some(10001));
        assert_eq!(pool.allocate("c"), Some(20000));
        assert_eq!(pool.allocate("d"), None);

        pool.release("b");
        assert_eq!(pool.allocate("d"), Some(10001));
    }

    #[test]
    fn exhaustion_returns_none_without_disturbing_bindings() {
        let mut pool = PortAllocator::new(vec![PortRange::new(10000, 10000)]);

        assert_eq!(pool.allocate("first"), Some(10000));
        assert_eq!(pool.allocate("second"), None);
        assert_eq!(pool.allocate("first"), Some(10000));
        assert_eq!(
            pool.allocations().into_iter().collect::<Vec<_>>(),
            vec![("first".to_string(), 10000)]
        );
    }

    #[test]
    fn fills_a_full_bucket_boundary() {
        // 65 ports forces the scan across the first bucket boundary.
        let mut pool = PortAllocator::new(vec![PortRange::new(10000, 10064)]);

        for i in 0..65u16 {
            assert_eq!(pool.allocate(&format!("k{i}")), Some(10000 + i));
        }

        assert_eq!(pool.allocate("overflow"), None);
        pool.release("k64");
        assert_eq!(pool.allocate("again"), Some(10064));
    }
}
