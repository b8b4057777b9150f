//! The coverage context: virgin maps, counters and running totals for one set of regions.
//!
//! A [`CoverageContext`] is obtained from [`CoverageChannel::finish_initialization`] once the
//! target reported its edge count. From then on, the driver alternates between running the
//! target and calling into the context. Calling into it while the target runs gives undefined
//! results, as the target writes the live bitmaps without any synchronization.

use edgecov_bolts::{
    layout::{bit, i32_slot},
    shmem::{ShMemProvider, StdShMemProvider},
    Error,
};

use crate::{
    channel::CoverageChannel,
    virgin::{discover, EdgeSet, VirginMap},
    IR_SHM_SIZE, LINE_SHM_SIZE, MAX_EDGES,
};

/// Byte size of the scanned part of the IR region
pub const IR_BITMAP_SIZE: usize = IR_SHM_SIZE / 4;
/// Number of IR indices
pub const NUM_EDGES_IR: u32 = (IR_BITMAP_SIZE * 8) as u32;

/// Computes `(num_edges, bitmap_size)` from the edge count the target reported.
///
/// `num_edges` includes the reserved index 0. `bitmap_size` is rounded up to whole 64 bit words.
pub fn edge_sizes(reported: u32) -> Result<(u32, usize), Error> {
    if reported == 0 {
        return Err(Error::fatal(
            "Coverage instrumentation reported no edges, it is not working",
        ));
    }
    let num_edges = u64::from(reported) + 1;
    if num_edges > MAX_EDGES as u64 {
        return Err(Error::fatal(format!(
            "Too many edges: {num_edges}, the edge region holds at most {MAX_EDGES}",
        )));
    }
    let num_edges = num_edges as usize;
    let bitmap_size = num_edges.div_ceil(8).next_multiple_of(8);
    Ok((num_edges as u32, bitmap_size))
}

/// The result of evaluating the edge channel once.
///
/// Both sets receive every discovery of the same scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeDiscovery {
    /// The newly discovered edges
    pub new_edges: EdgeSet,
    /// A second copy of the discoveries, for an independent consumer
    pub mirror: EdgeSet,
}

impl EdgeDiscovery {
    /// The number of newly discovered edges
    #[must_use]
    pub fn count(&self) -> usize {
        self.new_edges.len()
    }
}

/// Discovery state of the edge, IR and crash channels.
#[derive(Debug)]
pub struct CoverageContext<SP = StdShMemProvider>
where
    SP: ShMemProvider,
{
    channel: CoverageChannel<SP>,
    num_edges: u32,
    bitmap_size: usize,
    should_track_edges: bool,
    found_edges: u32,
    found_irs: u32,
    virgin_bits: VirginMap,
    virgin_bits_ir: VirginMap,
    crash_bits: VirginMap,
    edge_count: Option<Vec<u32>>,
    ir_count: Vec<u32>,
}

impl<SP> CoverageContext<SP>
where
    SP: ShMemProvider,
{
    pub(crate) fn new(
        channel: CoverageChannel<SP>,
        num_edges: u32,
        bitmap_size: usize,
        should_track_edges: bool,
    ) -> Self {
        log::info!("Coverage initialized with {num_edges} edges");
        let mut context = Self {
            channel,
            num_edges,
            bitmap_size,
            should_track_edges,
            found_edges: 0,
            found_irs: 0,
            virgin_bits: VirginMap::new(bitmap_size),
            virgin_bits_ir: VirginMap::new(IR_BITMAP_SIZE),
            crash_bits: VirginMap::new(bitmap_size),
            edge_count: should_track_edges.then(|| vec![0; num_edges as usize]),
            ir_count: vec![0; NUM_EDGES_IR as usize],
        };
        context.reserve_zero_edge();
        context
    }

    /// Index 0 means "no edge" to the instrumentation and is never reported.
    fn reserve_zero_edge(&mut self) {
        self.virgin_bits.mark_seen(0);
        self.crash_bits.mark_seen(0);
    }

    /// Evaluates the live edge bitmap.
    ///
    /// Every discovery lands in both sets of the returned [`EdgeDiscovery`].
    /// Hit counters are only updated if edge tracking is on.
    pub fn evaluate(&mut self) -> EdgeDiscovery {
        let mut sinks = (EdgeSet::new(), EdgeSet::new());
        let live = &self.channel.edge_bitmap()[..self.bitmap_size];
        let found = discover(
            live,
            &mut self.virgin_bits,
            self.edge_count.as_deref_mut(),
            &mut sinks,
        );
        self.found_edges = self.found_edges.saturating_add(found as u32);
        let (new_edges, mirror) = sinks;
        EdgeDiscovery { new_edges, mirror }
    }

    /// Evaluates the live IR bitmap, counting every hit.
    pub fn evaluate_ir(&mut self) -> EdgeSet {
        let mut new_irs = EdgeSet::new();
        let live = &self.channel.ir_edges()[..IR_BITMAP_SIZE];
        let found = discover(
            live,
            &mut self.virgin_bits_ir,
            Some(self.ir_count.as_mut_slice()),
            &mut new_irs,
        );
        self.found_irs = self.found_irs.saturating_add(found as u32);
        new_irs
    }

    /// Returns how many edges of the live edge bitmap were never seen in a crashing run before.
    ///
    /// Crash discoveries are tracked separately: the edge virgin map and `found_edges` stay untouched.
    pub fn evaluate_crash(&mut self) -> usize {
        let live = &self.channel.edge_bitmap()[..self.bitmap_size];
        discover(live, &mut self.crash_bits, None, &mut ())
    }

    /// `true` if every edge of `edges` is set in the live edge bitmap.
    #[must_use]
    pub fn compare_equal(&self, edges: &[u32]) -> bool {
        let live = &self.channel.edge_bitmap()[..self.bitmap_size];
        edges.iter().all(|&edge| bit(live, edge as usize))
    }

    /// `true` if IR index `edge` is set in the live IR bitmap.
    #[must_use]
    pub fn ir_compare_equal(&self, edge: u32) -> bool {
        bit(&self.channel.ir_edges()[..IR_BITMAP_SIZE], edge as usize)
    }

    /// Zeroes the live bitmaps and the line ids. The `num_edges` header is kept.
    pub fn clear_bitmap(&mut self) {
        let bitmap_size = self.bitmap_size;
        self.channel.edge_bitmap_mut()[..bitmap_size].fill(0);
        self.channel.ir_edges_mut()[..IR_BITMAP_SIZE].fill(0);
        self.channel.lines_mut().fill(0);
    }

    /// Forgets edge `edge`, so the next evaluation that hits it reports it as new.
    ///
    /// The edge must have been discovered before and, with tracking on, must have a nonzero
    /// hit count. Otherwise [`Error::ContractViolation`] is returned and nothing changes.
    pub fn clear_edge_data(&mut self, edge: u32) -> Result<(), Error> {
        self.check_forgettable(edge)?;
        let index = edge as usize;
        if let Some(count) = self
            .edge_count
            .as_mut()
            .and_then(|edge_count| edge_count.get_mut(index))
        {
            *count = 0;
        }
        self.virgin_bits.rearm(index);
        self.found_edges = self.found_edges.saturating_sub(1);
        Ok(())
    }

    /// Checks the preconditions of [`CoverageContext::clear_edge_data`] without changing anything.
    pub fn check_forgettable(&self, edge: u32) -> Result<(), Error> {
        let index = edge as usize;
        if index >= self.virgin_bits.capacity() || self.virgin_bits.is_virgin(index) {
            return Err(Error::contract_violation(format!(
                "Cannot forget edge {edge}, it was never discovered"
            )));
        }
        if let Some(edge_count) = &self.edge_count {
            if !edge_count.get(index).is_some_and(|&count| count > 0) {
                return Err(Error::contract_violation(format!(
                    "Cannot forget edge {edge}, it has no hits"
                )));
            }
        }
        Ok(())
    }

    /// Forgets IR index `edge`. Its hit count is kept.
    ///
    /// The index must have been discovered before, otherwise [`Error::ContractViolation`] is returned.
    pub fn ir_clear_edge_data(&mut self, edge: u32) -> Result<(), Error> {
        let index = edge as usize;
        if index >= self.virgin_bits_ir.capacity() || self.virgin_bits_ir.is_virgin(index) {
            return Err(Error::contract_violation(format!(
                "Cannot forget IR index {edge}, it was never discovered"
            )));
        }
        self.virgin_bits_ir.rearm(index);
        self.found_irs = self.found_irs.saturating_sub(1);
        Ok(())
    }

    /// Forgets everything that was discovered. The shared regions are left alone.
    pub fn reset_state(&mut self) {
        self.virgin_bits.reset();
        self.virgin_bits_ir.reset();
        self.crash_bits.reset();
        if let Some(edge_count) = &mut self.edge_count {
            edge_count.fill(0);
        }
        self.ir_count.fill(0);
        self.reserve_zero_edge();
        self.found_edges = 0;
        self.found_irs = 0;
    }

    /// The hit count of every edge, `num_edges` entries.
    ///
    /// Fails with [`Error::NotTracked`] if edge tracking was off at setup.
    pub fn get_edge_counts(&self) -> Result<&[u32], Error> {
        self.edge_count
            .as_deref()
            .ok_or_else(|| Error::not_tracked("Edge hit counts were not requested at setup"))
    }

    /// The hit count of every IR index, `num_edges_ir` entries.
    #[must_use]
    pub fn ir_get_edge_counts(&self) -> &[u32] {
        &self.ir_count
    }

    /// The line id the target recorded for IR index `edge`.
    pub fn get_op_line(&self, edge: u32) -> Result<i32, Error> {
        i32_slot(self.channel.lines(), edge as usize).ok_or_else(|| {
            Error::illegal_argument(format!(
                "No line slot for index {edge}, the line region has {} slots",
                LINE_SHM_SIZE / 4
            ))
        })
    }

    /// Number of edges, including the reserved index 0
    #[must_use]
    pub fn num_edges(&self) -> u32 {
        self.num_edges
    }

    /// Number of IR indices
    #[must_use]
    pub fn num_edges_ir(&self) -> u32 {
        NUM_EDGES_IR
    }

    /// Scanned bytes of the edge bitmap
    #[must_use]
    pub fn bitmap_size(&self) -> usize {
        self.bitmap_size
    }

    /// Scanned bytes of the IR bitmap
    #[must_use]
    pub fn bitmap_size_ir(&self) -> usize {
        IR_BITMAP_SIZE
    }

    /// Bytes of the line region
    #[must_use]
    pub fn bitmap_size_line(&self) -> usize {
        LINE_SHM_SIZE
    }

    /// Whether edge hit counts are collected
    #[must_use]
    pub fn should_track_edges(&self) -> bool {
        self.should_track_edges
    }

    /// Edges discovered so far
    #[must_use]
    pub fn found_edges(&self) -> u32 {
        self.found_edges
    }

    /// IR indices discovered so far
    #[must_use]
    pub fn found_irs(&self) -> u32 {
        self.found_irs
    }

    /// The never-seen mask of the edge channel
    #[must_use]
    pub fn virgin_bits(&self) -> &VirginMap {
        &self.virgin_bits
    }

    /// The never-seen mask of crashing runs
    #[must_use]
    pub fn crash_bits(&self) -> &VirginMap {
        &self.crash_bits
    }

    /// Replaces the edge and crash masks and the edge total, for example from an earlier session.
    pub(crate) fn restore(&mut self, found_edges: u32, virgin_bits: &[u8], crash_bits: &[u8]) {
        self.virgin_bits.copy_from(virgin_bits);
        self.crash_bits.copy_from(crash_bits);
        self.found_edges = found_edges;
    }

    /// The underlying regions
    #[must_use]
    pub fn channel(&self) -> &CoverageChannel<SP> {
        &self.channel
    }

    /// The underlying regions, mutable
    pub fn channel_mut(&mut self) -> &mut CoverageChannel<SP> {
        &mut self.channel
    }

    /// Unmaps and removes the shared regions.
    pub fn shutdown(self) -> Result<(), Error> {
        self.channel.shutdown()
    }
}
