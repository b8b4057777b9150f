//! Virgin maps and the scan that finds newly hit indices in a live bitmap.
//!
//! A virgin map has inverted semantics: a set bit means the index was never seen.
//! The scan walks the live bitmap in 64 bit words, skips untouched words,
//! and only inspects single bits where `live & virgin` is nonzero.

use core::slice;

use edgecov_bolts::layout::{self, words};
use serde::{Deserialize, Serialize};

/// Indices discovered by one evaluation, in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeSet {
    edges: Vec<u32>,
}

impl EdgeSet {
    /// Creates an empty [`EdgeSet`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an index
    pub fn push(&mut self, edge: u32) {
        self.edges.push(edge);
    }

    /// The number of indices in this set
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// `true` if nothing was discovered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// The indices, in the order they were recorded
    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.edges
    }

    /// Iterates over all indices
    pub fn iter(&self) -> slice::Iter<'_, u32> {
        self.edges.iter()
    }

    /// Returns `true` if `edge` is part of this set
    #[must_use]
    pub fn contains(&self, edge: u32) -> bool {
        self.edges.contains(&edge)
    }
}

impl From<Vec<u32>> for EdgeSet {
    fn from(edges: Vec<u32>) -> Self {
        Self { edges }
    }
}

impl FromIterator<u32> for EdgeSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self {
            edges: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for EdgeSet {
    type Item = u32;
    type IntoIter = std::vec::IntoIter<u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.edges.into_iter()
    }
}

impl<'a> IntoIterator for &'a EdgeSet {
    type Item = &'a u32;
    type IntoIter = slice::Iter<'a, u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.edges.iter()
    }
}

/// Receives every index a scan discovers.
pub trait DiscoverySink {
    /// Called once per newly discovered index
    fn record(&mut self, index: u32);
}

impl DiscoverySink for EdgeSet {
    fn record(&mut self, index: u32) {
        self.push(index);
    }
}

/// Discards discoveries, only the returned count is kept
impl DiscoverySink for () {
    fn record(&mut self, _index: u32) {}
}

/// Fans one discovery out to two independent sinks
impl<A, B> DiscoverySink for (A, B)
where
    A: DiscoverySink,
    B: DiscoverySink,
{
    fn record(&mut self, index: u32) {
        self.0.record(index);
        self.1.record(index);
    }
}

/// The never-seen mask of one coverage channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirginMap {
    bits: Vec<u8>,
}

impl VirginMap {
    /// Creates a map of `size` bytes where every index is virgin.
    ///
    /// `size` has to be a multiple of 8, as the scan consumes whole words.
    #[must_use]
    pub fn new(size: usize) -> Self {
        debug_assert_eq!(size % 8, 0);
        Self {
            bits: vec![0xff; size],
        }
    }

    /// Marks every index as virgin again
    pub fn reset(&mut self) {
        self.bits.fill(0xff);
    }

    /// Size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// `true` for a zero sized map
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// The number of indices this map addresses
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bits.len() * 8
    }

    /// `true` if `index` was never seen. Indices past the end are never virgin.
    #[must_use]
    pub fn is_virgin(&self, index: usize) -> bool {
        layout::bit(&self.bits, index)
    }

    /// Marks `index` as seen
    pub fn mark_seen(&mut self, index: usize) {
        layout::clear_bit(&mut self.bits, index);
    }

    /// Marks `index` as never seen, so the next scan reports it again
    pub fn rearm(&mut self, index: usize) {
        layout::set_bit(&mut self.bits, index);
    }

    /// The raw mask
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Overwrites the mask with `bytes`, which must have the same length.
    pub(crate) fn copy_from(&mut self, bytes: &[u8]) {
        self.bits.copy_from_slice(bytes);
    }

    /// The number of indices that are not virgin anymore
    #[must_use]
    pub fn count_seen(&self) -> usize {
        self.bits.iter().map(|b| b.count_zeros() as usize).sum()
    }
}

/// Scans `live` for indices that are still virgin in `virgin`.
///
/// Every such index is marked as seen and handed to `sink`, in ascending order.
/// If `counters` are given, a second pass increments the counter of every hit index,
/// new or not. Hits past the end of `counters` are not counted.
///
/// Returns the number of newly discovered indices.
pub fn discover<S>(
    live: &[u8],
    virgin: &mut VirginMap,
    counters: Option<&mut [u32]>,
    sink: &mut S,
) -> usize
where
    S: DiscoverySink,
{
    debug_assert_eq!(live.len(), virgin.len());
    let mut found = 0;

    for (i, (word, virgin_chunk)) in words(live)
        .zip(virgin.bits.chunks_exact_mut(8))
        .enumerate()
    {
        if word == 0 {
            continue;
        }
        let mut virgin_word =
            u64::from_le_bytes(<[u8; 8]>::try_from(&*virgin_chunk).unwrap_or_default());
        let mut fresh = word & virgin_word;
        if fresh == 0 {
            continue;
        }
        virgin_word &= !fresh;
        virgin_chunk.copy_from_slice(&virgin_word.to_le_bytes());

        let base = i * 64;
        while fresh != 0 {
            let bit = fresh.trailing_zeros() as usize;
            sink.record((base + bit) as u32);
            found += 1;
            fresh &= fresh - 1;
        }
    }

    if let Some(counters) = counters {
        count_hits(live, counters);
    }

    found
}

/// Increments `counters[i]` for every index `i` set in `live`.
pub fn count_hits(live: &[u8], counters: &mut [u32]) {
    for (i, word) in words(live).enumerate() {
        let mut hits = word;
        let base = i * 64;
        while hits != 0 {
            let bit = hits.trailing_zeros() as usize;
            if let Some(count) = counters.get_mut(base + bit) {
                *count = count.saturating_add(1);
            }
            hits &= hits - 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use edgecov_bolts::layout::set_bit;

    use super::{count_hits, discover, EdgeSet, VirginMap};

    fn live_with(size: usize, indices: &[usize]) -> Vec<u8> {
        let mut live = vec![0; size];
        for &index in indices {
            set_bit(&mut live, index);
        }
        live
    }

    #[test]
    fn test_discover_reports_new_indices_once() {
        let mut virgin = VirginMap::new(16);
        let live = live_with(16, &[1, 3, 64, 127]);

        let mut out = EdgeSet::new();
        assert_eq!(discover(&live, &mut virgin, None, &mut out), 4);
        assert_eq!(out.as_slice(), &[1, 3, 64, 127]);
        assert!(!virgin.is_virgin(64));
        assert!(virgin.is_virgin(2));

        let mut again = EdgeSet::new();
        assert_eq!(discover(&live, &mut virgin, None, &mut again), 0);
        assert!(again.is_empty());
        assert_eq!(virgin.count_seen(), 4);
    }

    #[test]
    fn test_discover_zero_map_is_noop() {
        let mut virgin = VirginMap::new(8);
        virgin.mark_seen(5);
        let before = virgin.clone();
        let mut counters = vec![0_u32; 64];

        let live = vec![0; 8];
        let mut out = EdgeSet::new();
        assert_eq!(
            discover(&live, &mut virgin, Some(&mut counters[..]), &mut out),
            0
        );
        assert!(out.is_empty());
        assert_eq!(virgin, before);
        assert!(counters.iter().all(|&c| c == 0));
    }

    #[test]
    fn test_discover_fills_both_sinks() {
        let mut virgin = VirginMap::new(8);
        let live = live_with(8, &[7, 9]);
        let mut out = (EdgeSet::new(), EdgeSet::new());
        assert_eq!(discover(&live, &mut virgin, None, &mut out), 2);
        assert_eq!(out.0.as_slice(), &[7, 9]);
        assert_eq!(out.0, out.1);

        virgin.rearm(9);
        assert_eq!(discover(&live, &mut virgin, None, &mut ()), 1);
    }

    #[test]
    fn test_counters_count_every_hit() {
        let mut virgin = VirginMap::new(8);
        let live = live_with(8, &[2, 4]);
        let mut counters = vec![0_u32; 5];

        discover(&live, &mut virgin, Some(&mut counters[..]), &mut ());
        discover(&live, &mut virgin, Some(&mut counters[..]), &mut ());
        assert_eq!(counters, vec![0, 0, 2, 0, 2]);

        // index 6 has no counter slot
        count_hits(&live_with(8, &[6]), &mut counters);
        assert_eq!(counters, vec![0, 0, 2, 0, 2]);
    }

    #[test]
    fn test_virgin_map_reset() {
        let mut virgin = VirginMap::new(8);
        assert_eq!(virgin.capacity(), 64);
        virgin.mark_seen(0);
        virgin.mark_seen(63);
        assert_eq!(virgin.count_seen(), 2);
        virgin.reset();
        assert_eq!(virgin.count_seen(), 0);
        assert!(!virgin.is_virgin(64));
    }
}
