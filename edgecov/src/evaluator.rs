//! Program level coverage evaluation on top of a [`CoverageContext`].
//!
//! The [`ProgramCoverageEvaluator`] turns raw discoveries into aspects a corpus can keep,
//! tracks how often single edges had to be forgotten, and tells deterministic edges
//! from flaky ones by running a program twice.

use core::mem;

use edgecov_bolts::{
    shmem::{ShMemProvider, StdShMemProvider},
    Error,
};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::{
    channel::CoverageChannel, context::CoverageContext, options::CoverageOptions, virgin::EdgeSet,
};

/// The edges that made a program interesting
pub type CoverageAspects = EdgeSet;

/// An IR index a program reached, and the edges it discovered while doing so.
///
/// `edges` is empty for aspects of a plain IR discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IrAspects {
    /// The IR index
    pub ir_id: u32,
    /// Edges that have to be hit together with `ir_id`
    pub edges: EdgeSet,
}

impl IrAspects {
    /// Creates aspects for IR index `ir_id` alone
    #[must_use]
    pub fn new(ir_id: u32) -> Self {
        Self {
            ir_id,
            edges: EdgeSet::new(),
        }
    }
}

/// Everything one evaluation found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationOutcome {
    /// The new edges, `None` if there were none
    pub new_edges: Option<CoverageAspects>,
    /// IR indices seen for the first time, one aspect each
    pub new_irs: Vec<IrAspects>,
    /// Set if the program kept the IR index it was derived from *and* found new edges
    pub preserved: Option<IrAspects>,
}

impl EvaluationOutcome {
    /// `true` if nothing new was found
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_edges.is_none() && self.new_irs.is_empty()
    }
}

/// The result of [`ProgramCoverageEvaluator::compute_aspect_intersection`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AspectIntersection {
    /// The edges both runs found, `None` if the rerun failed or shared nothing with the first run
    pub edges: Option<CoverageAspects>,
    /// IR indices the rerun reached for the first time
    pub new_irs: Vec<IrAspects>,
}

#[derive(Debug)]
enum Stage<SP>
where
    SP: ShMemProvider,
{
    /// Regions exist, the target did not report its edges yet
    Created(CoverageChannel<SP>),
    Ready(CoverageContext<SP>),
    /// Initialization failed, nothing is usable anymore
    Broken,
}

/// Coverage evaluation for whole programs.
///
/// Usage:
/// 1. [`ProgramCoverageEvaluator::new`], then pass [`ProgramCoverageEvaluator::env_vars`] to the target,
/// 2. run the target once, so it reports its edge count,
/// 3. [`ProgramCoverageEvaluator::initialize`],
/// 4. per execution: [`ProgramCoverageEvaluator::pre_exec`], run, [`ProgramCoverageEvaluator::evaluate`].
#[derive(Debug)]
pub struct ProgramCoverageEvaluator<SP = StdShMemProvider>
where
    SP: ShMemProvider,
{
    options: CoverageOptions,
    stage: Stage<SP>,
    /// How often each edge was forgotten
    reset_counts: HashMap<u32, u64>,
}

impl ProgramCoverageEvaluator<StdShMemProvider> {
    /// Creates the shared regions for `options.context_id`.
    pub fn new(options: CoverageOptions) -> Result<Self, Error> {
        Self::with_provider(StdShMemProvider::new()?, options)
    }
}

impl<SP> ProgramCoverageEvaluator<SP>
where
    SP: ShMemProvider,
{
    /// Creates the shared regions with `provider`.
    pub fn with_provider(provider: SP, options: CoverageOptions) -> Result<Self, Error> {
        let channel = CoverageChannel::with_provider(provider, options.context_id)?;
        Ok(Self {
            options,
            stage: Stage::Created(channel),
            reset_counts: HashMap::new(),
        })
    }

    /// The options this evaluator was built with
    #[must_use]
    pub fn options(&self) -> &CoverageOptions {
        &self.options
    }

    /// The shared regions
    pub fn channel(&self) -> Result<&CoverageChannel<SP>, Error> {
        match &self.stage {
            Stage::Created(channel) => Ok(channel),
            Stage::Ready(context) => Ok(context.channel()),
            Stage::Broken => Err(broken()),
        }
    }

    /// The shared regions, mutable
    pub fn channel_mut(&mut self) -> Result<&mut CoverageChannel<SP>, Error> {
        match &mut self.stage {
            Stage::Created(channel) => Ok(channel),
            Stage::Ready(context) => Ok(context.channel_mut()),
            Stage::Broken => Err(broken()),
        }
    }

    /// The env vars the target needs to find the shared regions
    pub fn env_vars(&self) -> Result<[(&'static str, String); 3], Error> {
        Ok(self.channel()?.env_vars())
    }

    /// `true` once [`ProgramCoverageEvaluator::initialize`] succeeded
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        matches!(self.stage, Stage::Ready(_))
    }

    /// The coverage context, once initialized
    pub fn context(&self) -> Result<&CoverageContext<SP>, Error> {
        match &self.stage {
            Stage::Ready(context) => Ok(context),
            _ => Err(not_ready()),
        }
    }

    /// The coverage context, mutable, once initialized
    pub fn context_mut(&mut self) -> Result<&mut CoverageContext<SP>, Error> {
        match &mut self.stage {
            Stage::Ready(context) => Ok(context),
            _ => Err(not_ready()),
        }
    }

    /// Sizes the evaluation state after the target's first run reported its edge count.
    ///
    /// A [`Error::Fatal`] error leaves the evaluator unusable.
    pub fn initialize(&mut self) -> Result<(), Error> {
        match mem::replace(&mut self.stage, Stage::Broken) {
            Stage::Created(channel) => {
                let context = channel.finish_initialization(self.options.track_edges)?;
                log::info!("Initialized, {} edges", context.num_edges());
                self.stage = Stage::Ready(context);
                Ok(())
            }
            Stage::Ready(context) => {
                self.stage = Stage::Ready(context);
                Err(Error::illegal_state("Coverage evaluator is already initialized"))
            }
            Stage::Broken => Err(broken()),
        }
    }

    /// Clears the live bitmaps. Has to run before every execution of the target.
    pub fn pre_exec(&mut self) -> Result<(), Error> {
        self.context_mut()?.clear_bitmap();
        Ok(())
    }

    /// Evaluates a finished, non-crashing execution.
    ///
    /// `origin` is the IR index the program was derived from, if any. If the execution still
    /// reaches it and found new edges, [`EvaluationOutcome::preserved`] pairs both.
    pub fn evaluate(&mut self, origin: Option<u32>) -> Result<EvaluationOutcome, Error> {
        let context = self.context_mut()?;
        let discovery = context.evaluate();
        let new_irs = context.evaluate_ir();

        let preserved = origin
            .filter(|&ir_id| discovery.count() > 0 && context.ir_compare_equal(ir_id))
            .map(|ir_id| IrAspects {
                ir_id,
                edges: discovery.mirror,
            });

        Ok(EvaluationOutcome {
            new_edges: (!discovery.new_edges.is_empty()).then_some(discovery.new_edges),
            new_irs: new_irs.into_iter().map(IrAspects::new).collect(),
            preserved,
        })
    }

    /// `true` if a crashing execution hit an edge no crash hit before.
    pub fn evaluate_crash(&mut self) -> Result<bool, Error> {
        Ok(self.context_mut()?.evaluate_crash() > 0)
    }

    /// `true` if the last execution hit every edge of `aspects`.
    pub fn has_aspects(&self, aspects: &CoverageAspects) -> Result<bool, Error> {
        Ok(self.context()?.compare_equal(aspects.as_slice()))
    }

    /// `true` if the last execution reached the IR index of `aspects` and all its edges.
    pub fn has_ir_aspects(&self, aspects: &IrAspects) -> Result<bool, Error> {
        let context = self.context()?;
        Ok(context.ir_compare_equal(aspects.ir_id)
            && (aspects.edges.is_empty() || context.compare_equal(aspects.edges.as_slice())))
    }

    /// The source line the last execution recorded for the IR index of `aspects`.
    pub fn line_of(&self, aspects: &IrAspects) -> Result<i32, Error> {
        self.context()?.get_op_line(aspects.ir_id)
    }

    /// Forgets `edge`, unless it was forgotten more than `max_reset_count` times already.
    ///
    /// Edges over the limit stay discovered and drop out of [`ProgramCoverageEvaluator::edge_hit_counts`].
    /// If the edge cannot be forgotten, nothing changes, its reset count included.
    pub fn reset_edge(&mut self, edge: u32) -> Result<(), Error> {
        self.forget_edges(&[edge])
    }

    /// Forgets all of `edges`, or none of them if one cannot be forgotten.
    fn forget_edges(&mut self, edges: &[u32]) -> Result<(), Error> {
        let max_reset_count = self.options.max_reset_count;
        let context = match &mut self.stage {
            Stage::Ready(context) => context,
            _ => return Err(not_ready()),
        };

        let mut seen = HashSet::with_capacity(edges.len());
        let mut pending: Vec<(u32, u64)> = Vec::with_capacity(edges.len());
        for &edge in edges {
            if !seen.insert(edge) {
                continue;
            }
            let count = self.reset_counts.get(&edge).copied().unwrap_or(0) + 1;
            if count <= max_reset_count {
                context.check_forgettable(edge)?;
            }
            pending.push((edge, count));
        }

        for (edge, count) in pending {
            if count <= max_reset_count {
                context.clear_edge_data(edge)?;
            } else {
                log::debug!("Edge {edge} was reset {count} times, treating it as non-deterministic");
            }
            self.reset_counts.insert(edge, count);
        }
        Ok(())
    }

    /// The number of edges that hit the reset limit
    #[must_use]
    pub fn non_deterministic_edges(&self) -> usize {
        self.reset_counts
            .values()
            .filter(|&&count| count >= self.options.max_reset_count)
            .count()
    }

    /// Edge hit counts, with edges at the reset limit zeroed.
    ///
    /// Empty if edge tracking is off.
    #[must_use]
    pub fn edge_hit_counts(&self) -> Vec<u32> {
        let counts = match self.context().and_then(CoverageContext::get_edge_counts) {
            Ok(counts) => counts,
            Err(err) => {
                log::error!("Error retrieving edge hit counts: {err}");
                return Vec::new();
            }
        };
        let mut counts = counts.to_vec();
        for (&edge, &resets) in &self.reset_counts {
            if resets >= self.options.max_reset_count {
                if let Some(count) = counts.get_mut(edge as usize) {
                    *count = 0;
                }
            }
        }
        counts
    }

    /// IR hit counts. Empty before initialization.
    #[must_use]
    pub fn ir_hit_counts(&self) -> Vec<u32> {
        match self.context() {
            Ok(context) => context.ir_get_edge_counts().to_vec(),
            Err(err) => {
                log::error!("Error retrieving IR hit counts: {err}");
                Vec::new()
            }
        }
    }

    /// Finds the edges of `first` that a program hits deterministically.
    ///
    /// Forgets the edges of `first`, then lets `rerun` execute the program again. `rerun`
    /// returns `false` if that execution did not succeed. Edges only the rerun found are
    /// forgotten again. If one edge of `first` cannot be forgotten, nothing is forgotten
    /// and the rerun does not happen.
    pub fn compute_aspect_intersection<F>(
        &mut self,
        first: &CoverageAspects,
        rerun: F,
    ) -> Result<AspectIntersection, Error>
    where
        F: FnOnce(&mut CoverageChannel<SP>) -> Result<bool, Error>,
    {
        self.forget_edges(first.as_slice())?;

        self.pre_exec()?;
        if !rerun(self.channel_mut()?)? {
            return Ok(AspectIntersection::default());
        }
        let outcome = self.evaluate(None)?;
        let Some(second) = outcome.new_edges else {
            return Ok(AspectIntersection {
                edges: None,
                new_irs: outcome.new_irs,
            });
        };

        let first_edges: HashSet<u32> = first.iter().copied().collect();
        let (intersection, flaky): (Vec<u32>, Vec<u32>) = second
            .into_iter()
            .partition(|edge| first_edges.contains(edge));
        if let Err(err) = self.forget_edges(&flaky) {
            log::warn!("Could not forget edges only the rerun found: {err}");
        }

        Ok(AspectIntersection {
            edges: (!intersection.is_empty()).then(|| EdgeSet::from(intersection)),
            new_irs: outcome.new_irs,
        })
    }

    /// The share of all edges discovered so far, `0.0` before initialization.
    #[must_use]
    pub fn current_score(&self) -> f64 {
        self.context().map_or(0.0, |context| {
            f64::from(context.found_edges()) / f64::from(context.num_edges())
        })
    }

    /// Edges discovered so far
    pub fn found_edges(&self) -> Result<u32, Error> {
        Ok(self.context()?.found_edges())
    }

    /// IR indices discovered so far
    pub fn found_irs(&self) -> Result<u32, Error> {
        Ok(self.context()?.found_irs())
    }

    /// Serializes the edge and crash discovery state, see [`CoverageContext::export_state`]
    pub fn export_state(&self) -> Result<Vec<u8>, Error> {
        self.context()?.export_state()
    }

    /// Imports a state from [`ProgramCoverageEvaluator::export_state`] of another instance
    pub fn import_state(&mut self, state: &[u8]) -> Result<(), Error> {
        self.context_mut()?.import_state(state)
    }

    /// Forgets all discoveries and reset counts
    pub fn reset_state(&mut self) -> Result<(), Error> {
        self.context_mut()?.reset_state();
        self.reset_counts.clear();
        Ok(())
    }

    /// Removes the shared regions
    pub fn shutdown(self) -> Result<(), Error> {
        match self.stage {
            Stage::Created(channel) => channel.shutdown(),
            Stage::Ready(context) => context.shutdown(),
            Stage::Broken => Ok(()),
        }
    }
}

fn not_ready() -> Error {
    Error::illegal_state("Coverage evaluator is not initialized")
}

fn broken() -> Error {
    Error::illegal_state("Coverage evaluator failed to initialize")
}

#[cfg(test)]
mod tests {
    use edgecov_bolts::{
        layout::set_bit,
        shmem::{NopShMemProvider, ShMemProvider},
        Error,
    };

    use super::{AspectIntersection, IrAspects, ProgramCoverageEvaluator};
    use crate::{options::CoverageOptions, virgin::EdgeSet};

    fn evaluator(options: CoverageOptions) -> ProgramCoverageEvaluator<NopShMemProvider> {
        let mut evaluator =
            ProgramCoverageEvaluator::with_provider(NopShMemProvider::new().unwrap(), options)
                .unwrap();
        // what the target does on its first run
        evaluator
            .channel_mut()
            .unwrap()
            .set_reported_edges(99)
            .unwrap();
        evaluator.initialize().unwrap();
        evaluator
    }

    fn run(
        evaluator: &mut ProgramCoverageEvaluator<NopShMemProvider>,
        edges: &[usize],
        irs: &[usize],
    ) {
        evaluator.pre_exec().unwrap();
        let channel = evaluator.channel_mut().unwrap();
        for &edge in edges {
            set_bit(channel.edge_bitmap_mut(), edge);
        }
        for &ir in irs {
            set_bit(channel.ir_edges_mut(), ir);
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut broken = ProgramCoverageEvaluator::with_provider(
            NopShMemProvider::new().unwrap(),
            CoverageOptions::default(),
        )
        .unwrap();
        assert!(!broken.is_initialized());
        assert!(broken.evaluate(None).is_err());
        assert!(broken.env_vars().is_ok());
        assert_eq!(broken.current_score(), 0.0);

        // the target never reported any edges
        assert!(broken.initialize().unwrap_err().is_fatal());
        assert!(matches!(broken.initialize(), Err(Error::IllegalState(..))));
        assert!(broken.channel().is_err());
        broken.shutdown().unwrap();

        let mut ready = evaluator(CoverageOptions::default());
        assert!(ready.is_initialized());
        assert!(ready.initialize().is_err());
        assert!(ready.is_initialized());
        ready.shutdown().unwrap();
    }

    #[test]
    fn test_evaluate_outcome() {
        let mut evaluator = evaluator(CoverageOptions::default());
        run(&mut evaluator, &[4, 8], &[30]);
        let outcome = evaluator.evaluate(Some(30)).unwrap();
        assert_eq!(outcome.new_edges, Some(EdgeSet::from(vec![4, 8])));
        assert_eq!(outcome.new_irs, vec![IrAspects::new(30)]);
        let preserved = outcome.preserved.unwrap();
        assert_eq!(preserved.ir_id, 30);
        assert_eq!(preserved.edges.as_slice(), &[4, 8]);
        assert_eq!(evaluator.found_edges().unwrap(), 2);
        assert_eq!(evaluator.found_irs().unwrap(), 1);
        assert!((evaluator.current_score() - 0.02).abs() < f64::EPSILON);

        // nothing new, origin no longer reached
        run(&mut evaluator, &[4], &[]);
        let outcome = evaluator.evaluate(Some(30)).unwrap();
        assert!(outcome.is_empty());
        assert!(outcome.preserved.is_none());

        // preserving needs the origin and new edges
        run(&mut evaluator, &[5], &[31]);
        let outcome = evaluator.evaluate(Some(31)).unwrap();
        assert!(outcome.preserved.is_some());
        run(&mut evaluator, &[5], &[31]);
        assert!(evaluator.evaluate(Some(31)).unwrap().preserved.is_none());
    }

    #[test]
    fn test_aspects() {
        let mut evaluator = evaluator(CoverageOptions::default());
        run(&mut evaluator, &[1, 2], &[7]);
        evaluator
            .channel_mut()
            .unwrap()
            .lines_mut()[28..32]
            .copy_from_slice(&12_i32.to_ne_bytes());

        assert!(evaluator.has_aspects(&EdgeSet::from(vec![1, 2])).unwrap());
        assert!(!evaluator.has_aspects(&EdgeSet::from(vec![1, 3])).unwrap());

        let mut aspects = IrAspects::new(7);
        assert!(evaluator.has_ir_aspects(&aspects).unwrap());
        assert_eq!(evaluator.line_of(&aspects).unwrap(), 12);
        aspects.edges = EdgeSet::from(vec![2]);
        assert!(evaluator.has_ir_aspects(&aspects).unwrap());
        aspects.edges = EdgeSet::from(vec![3]);
        assert!(!evaluator.has_ir_aspects(&aspects).unwrap());
        assert!(!evaluator.has_ir_aspects(&IrAspects::new(8)).unwrap());
    }

    #[test]
    fn test_crash_evaluation() {
        let mut evaluator = evaluator(CoverageOptions::default());
        run(&mut evaluator, &[3], &[]);
        assert!(evaluator.evaluate_crash().unwrap());
        assert!(!evaluator.evaluate_crash().unwrap());
        assert_eq!(evaluator.found_edges().unwrap(), 0);
    }

    #[test]
    fn test_reset_limit() {
        let options = CoverageOptions::builder()
            .track_edges(true)
            .max_reset_count(2)
            .build();
        let mut evaluator = evaluator(options);

        for _ in 0..2 {
            run(&mut evaluator, &[9, 10], &[]);
            assert!(evaluator.evaluate(None).unwrap().new_edges.unwrap().contains(9));
            evaluator.reset_edge(9).unwrap();
        }
        assert_eq!(evaluator.non_deterministic_edges(), 1);
        assert_eq!(evaluator.edge_hit_counts()[9], 0);
        assert_eq!(evaluator.edge_hit_counts()[10], 2);

        // over the limit, the edge stays discovered
        run(&mut evaluator, &[9], &[]);
        assert_eq!(evaluator.evaluate(None).unwrap().new_edges, Some(EdgeSet::from(vec![9])));
        evaluator.reset_edge(9).unwrap();
        run(&mut evaluator, &[9], &[]);
        assert!(evaluator.evaluate(None).unwrap().new_edges.is_none());

        evaluator.reset_state().unwrap();
        assert_eq!(evaluator.non_deterministic_edges(), 0);
        assert_eq!(evaluator.found_edges().unwrap(), 0);
    }

    #[test]
    fn test_hit_counts_without_tracking() {
        let mut evaluator = evaluator(CoverageOptions::default());
        assert!(evaluator.edge_hit_counts().is_empty());
        run(&mut evaluator, &[], &[3]);
        evaluator.evaluate(None).unwrap();
        assert_eq!(evaluator.ir_hit_counts()[3], 1);
    }

    #[test]
    fn test_aspect_intersection() {
        let mut evaluator = evaluator(CoverageOptions::default());
        run(&mut evaluator, &[1, 2, 3], &[]);
        let first = evaluator.evaluate(None).unwrap().new_edges.unwrap();

        // edge 3 is flaky, edge 4 only shows up in the rerun
        let intersection = evaluator
            .compute_aspect_intersection(&first, |channel| {
                set_bit(channel.edge_bitmap_mut(), 1);
                set_bit(channel.edge_bitmap_mut(), 2);
                set_bit(channel.edge_bitmap_mut(), 4);
                Ok(true)
            })
            .unwrap();
        assert_eq!(intersection.edges, Some(EdgeSet::from(vec![1, 2])));
        assert!(intersection.new_irs.is_empty());
        assert_eq!(evaluator.found_edges().unwrap(), 2);

        // 3 and 4 are virgin again
        run(&mut evaluator, &[3, 4], &[]);
        assert_eq!(
            evaluator.evaluate(None).unwrap().new_edges,
            Some(EdgeSet::from(vec![3, 4]))
        );
    }

    #[test]
    fn test_aspect_intersection_failed_rerun() {
        let mut evaluator = evaluator(CoverageOptions::default());
        run(&mut evaluator, &[5], &[]);
        let first = evaluator.evaluate(None).unwrap().new_edges.unwrap();

        let failed = evaluator
            .compute_aspect_intersection(&first, |_| Ok(false))
            .unwrap();
        assert_eq!(failed, AspectIntersection::default());

        // nothing reproduced
        run(&mut evaluator, &[5], &[]);
        evaluator.evaluate(None).unwrap();
        let first = EdgeSet::from(vec![5]);
        let empty = evaluator
            .compute_aspect_intersection(&first, |_| Ok(true))
            .unwrap();
        assert!(empty.edges.is_none());
    }

    #[test]
    fn test_aspect_intersection_reports_rerun_irs() {
        let mut evaluator = evaluator(CoverageOptions::default());
        run(&mut evaluator, &[1], &[]);
        let first = evaluator.evaluate(None).unwrap().new_edges.unwrap();

        let intersection = evaluator
            .compute_aspect_intersection(&first, |channel| {
                set_bit(channel.edge_bitmap_mut(), 1);
                set_bit(channel.ir_edges_mut(), 40);
                Ok(true)
            })
            .unwrap();
        assert_eq!(intersection.edges, Some(EdgeSet::from(vec![1])));
        assert_eq!(intersection.new_irs, vec![IrAspects::new(40)]);
        assert_eq!(evaluator.found_irs().unwrap(), 1);

        // an IR index found by a rerun without new edges is handed out too
        let intersection = evaluator
            .compute_aspect_intersection(&EdgeSet::from(vec![1]), |channel| {
                set_bit(channel.ir_edges_mut(), 41);
                Ok(true)
            })
            .unwrap();
        assert!(intersection.edges.is_none());
        assert_eq!(intersection.new_irs, vec![IrAspects::new(41)]);
    }

    #[test]
    fn test_failed_reset_changes_nothing() {
        let options = CoverageOptions::builder()
            .track_edges(true)
            .max_reset_count(1)
            .build();
        let mut evaluator = evaluator(options);

        assert!(evaluator.reset_edge(5).unwrap_err().is_contract_violation());
        assert_eq!(evaluator.non_deterministic_edges(), 0);

        // one bad edge keeps every edge of the set discovered
        run(&mut evaluator, &[1, 2], &[]);
        let first = evaluator.evaluate(None).unwrap().new_edges.unwrap();
        let mut with_unknown = first.clone();
        with_unknown.push(5);
        let mut reran = false;
        let result = evaluator.compute_aspect_intersection(&with_unknown, |_| {
            reran = true;
            Ok(true)
        });
        assert!(result.unwrap_err().is_contract_violation());
        assert!(!reran);
        assert_eq!(evaluator.found_edges().unwrap(), 2);
        assert_eq!(evaluator.non_deterministic_edges(), 0);
        assert_eq!(evaluator.edge_hit_counts()[1], 1);

        evaluator.reset_edge(1).unwrap();
        assert_eq!(evaluator.non_deterministic_edges(), 1);
        assert_eq!(evaluator.found_edges().unwrap(), 1);
    }

    #[test]
    fn test_state_roundtrip_through_evaluator() {
        let mut first = evaluator(CoverageOptions::default());
        run(&mut first, &[6], &[]);
        first.evaluate(None).unwrap();
        let state = first.export_state().unwrap();

        let mut second = evaluator(CoverageOptions::default());
        second.import_state(&state).unwrap();
        run(&mut second, &[6], &[]);
        assert!(second.evaluate(None).unwrap().new_edges.is_none());
        assert_eq!(second.found_edges().unwrap(), 1);
    }
}
