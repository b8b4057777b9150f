//! Export and import of the edge discovery state, to carry it over into another session
//! or another instance fuzzing the same build of the target.

use edgecov_bolts::{shmem::ShMemProvider, Error};
use serde::{Deserialize, Serialize};

use crate::context::CoverageContext;

/// The discovery state of the edge and crash channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageState {
    /// Edge count the state was recorded with, reserved index included
    pub num_edges: u32,
    /// Bytes of each mask
    pub bitmap_size: u32,
    /// Edges discovered when the state was recorded
    pub found_edges: u32,
    /// The edge never-seen mask
    pub virgin_bits: Vec<u8>,
    /// The crash never-seen mask
    pub crash_bits: Vec<u8>,
}

impl CoverageState {
    /// Takes a copy of the current state of `context`.
    #[must_use]
    pub fn capture<SP>(context: &CoverageContext<SP>) -> Self
    where
        SP: ShMemProvider,
    {
        Self {
            num_edges: context.num_edges(),
            bitmap_size: context.bitmap_size() as u32,
            found_edges: context.found_edges(),
            virgin_bits: context.virgin_bits().as_bytes().to_vec(),
            crash_bits: context.crash_bits().as_bytes().to_vec(),
        }
    }

    /// Checks that this state fits `context`, then overwrites its edge and crash state.
    pub fn apply<SP>(&self, context: &mut CoverageContext<SP>) -> Result<(), Error>
    where
        SP: ShMemProvider,
    {
        if self.num_edges != context.num_edges()
            || self.bitmap_size as usize != context.bitmap_size()
        {
            return Err(Error::illegal_argument(format!(
                "Cannot import coverage state for {} edges into a context with {} edges. \
                 Ensure all instances use the same build of the target",
                self.num_edges,
                context.num_edges()
            )));
        }
        if self.virgin_bits.len() != context.bitmap_size()
            || self.crash_bits.len() != context.bitmap_size()
        {
            return Err(Error::illegal_argument(format!(
                "Cannot import coverage state, expected masks of {} bytes, got {} and {}",
                context.bitmap_size(),
                self.virgin_bits.len(),
                self.crash_bits.len()
            )));
        }
        // every found edge is a cleared bit of the mask, index 0 excluded
        if self.found_edges as usize >= context.bitmap_size() * 8 {
            return Err(Error::illegal_argument(format!(
                "Cannot import coverage state with {} edges found, the masks hold {} bits",
                self.found_edges,
                context.bitmap_size() * 8
            )));
        }
        context.restore(self.found_edges, &self.virgin_bits, &self.crash_bits);
        Ok(())
    }
}

impl<SP> CoverageContext<SP>
where
    SP: ShMemProvider,
{
    /// Serializes the edge and crash discovery state.
    pub fn export_state(&self) -> Result<Vec<u8>, Error> {
        Ok(postcard::to_allocvec(&CoverageState::capture(self))?)
    }

    /// Replaces the edge and crash discovery state with one from [`CoverageContext::export_state`].
    ///
    /// States recorded for a different edge count are rejected with [`Error::IllegalArgument`].
    pub fn import_state(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let state: CoverageState = postcard::from_bytes(bytes)?;
        state.apply(self)?;
        log::info!(
            "Imported existing coverage state with {} edges already discovered",
            state.found_edges
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use edgecov_bolts::{
        layout::set_bit,
        shmem::{NopShMemProvider, ShMemProvider},
        Error,
    };

    use super::CoverageState;
    use crate::{channel::CoverageChannel, context::CoverageContext};

    fn context(reported: u32) -> CoverageContext<NopShMemProvider> {
        let mut channel =
            CoverageChannel::with_provider(NopShMemProvider::new().unwrap(), 0).unwrap();
        channel.set_reported_edges(reported).unwrap();
        channel.finish_initialization(false).unwrap()
    }

    #[test]
    fn test_import_carries_discoveries() {
        let mut first = context(100);
        set_bit(first.channel_mut().edge_bitmap_mut(), 12);
        set_bit(first.channel_mut().edge_bitmap_mut(), 13);
        first.evaluate();
        first.evaluate_crash();
        let exported = first.export_state().unwrap();

        let mut second = context(100);
        second.import_state(&exported).unwrap();
        assert_eq!(second.found_edges(), 2);
        assert_eq!(second.virgin_bits(), first.virgin_bits());

        set_bit(second.channel_mut().edge_bitmap_mut(), 12);
        set_bit(second.channel_mut().edge_bitmap_mut(), 14);
        assert_eq!(second.evaluate().new_edges.as_slice(), &[14]);
        assert_eq!(second.evaluate_crash(), 1);
    }

    #[test]
    fn test_import_rejects_other_builds() {
        let exported = context(100).export_state().unwrap();
        let mut other = context(1000);
        assert!(matches!(
            other.import_state(&exported),
            Err(Error::IllegalArgument(..))
        ));
        assert_eq!(other.found_edges(), 0);

        let mut state = CoverageState::capture(&context(100));
        state.crash_bits.pop();
        assert!(state.apply(&mut context(100)).is_err());

        let mut state = CoverageState::capture(&context(100));
        state.found_edges = u32::MAX;
        let mut target = context(100);
        assert!(matches!(
            state.apply(&mut target),
            Err(Error::IllegalArgument(..))
        ));
        assert_eq!(target.found_edges(), 0);

        assert!(matches!(
            context(100).import_state(&[1, 2, 3]),
            Err(Error::Serialize(..))
        ));
    }
}
