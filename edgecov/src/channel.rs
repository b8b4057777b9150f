//! The three shared regions exchanged with the target process.
//!
//! * the edge region: a `num_edges` header, then the live edge bitmap,
//! * the IR region: the live IR bitmap,
//! * the line region: one `i32` line id per IR index.
//!
//! The controller creates the regions with [`CoverageChannel::initialize`] and hands their
//! names to the target through [`CoverageChannel::env_vars`]. The target side maps them with
//! [`CoverageChannel::attach_from_env`].

use std::process;

use edgecov_bolts::{
    layout::{Field, Layout},
    shmem::{ShMem, ShMemId, ShMemProvider, StdShMemProvider},
    Error,
};

use crate::{
    context::{edge_sizes, CoverageContext},
    options::{region_names, SHM_ID3_ENV, SHM_ID4_ENV, SHM_ID_ENV},
    EDGE_HEADER_SIZE, EDGE_SHM_SIZE, IR_SHM_SIZE, LINE_SHM_SIZE,
};

/// The `num_edges` header the target writes once it started
pub const EDGE_COUNT_FIELD: Field = Field::new("num_edges", 0, EDGE_HEADER_SIZE);
/// The live edge bitmap
pub const EDGE_BITMAP_FIELD: Field =
    Field::new("edges", EDGE_HEADER_SIZE, EDGE_SHM_SIZE - EDGE_HEADER_SIZE);
/// The live IR bitmap
pub const IR_BITMAP_FIELD: Field = Field::new("ir_edges", 0, IR_SHM_SIZE);
/// The line ids, one `i32` per slot
pub const LINES_FIELD: Field = Field::new("lines", 0, LINE_SHM_SIZE);

static EDGE_FIELDS: [Field; 2] = [EDGE_COUNT_FIELD, EDGE_BITMAP_FIELD];
static IR_FIELDS: [Field; 1] = [IR_BITMAP_FIELD];
static LINE_FIELDS: [Field; 1] = [LINES_FIELD];

/// Layout of the edge region
pub static EDGE_LAYOUT: Layout = Layout::new("edge region", &EDGE_FIELDS);
/// Layout of the IR region
pub static IR_LAYOUT: Layout = Layout::new("ir region", &IR_FIELDS);
/// Layout of the line region
pub static LINE_LAYOUT: Layout = Layout::new("line region", &LINE_FIELDS);

/// The three mapped coverage regions.
///
/// The mappings hold raw pointers into shared memory, so this is neither [`Send`] nor [`Sync`].
/// Only one side may access a region at a time, the execution driver enforces that.
#[derive(Debug)]
pub struct CoverageChannel<SP = StdShMemProvider>
where
    SP: ShMemProvider,
{
    provider: SP,
    context_id: u32,
    edges: SP::ShMem,
    ir_edges: SP::ShMem,
    lines: SP::ShMem,
    /// Only the creating side unlinks the names on shutdown
    owner: bool,
}

impl CoverageChannel<StdShMemProvider> {
    /// Creates the regions for `context_id` with the os shared memory of this platform.
    pub fn initialize(context_id: u32) -> Result<Self, Error> {
        Self::with_provider(StdShMemProvider::new()?, context_id)
    }

    /// Maps the regions named by the `SHM_ID*` env vars, as the target does.
    pub fn attach_from_env() -> Result<Self, Error> {
        Self::attach_with_provider(StdShMemProvider::new()?)
    }
}

impl<SP> CoverageChannel<SP>
where
    SP: ShMemProvider,
{
    /// Creates the regions for `context_id` in this process using `provider`.
    ///
    /// If one region cannot be created, the ones created before it are unlinked again.
    pub fn with_provider(mut provider: SP, context_id: u32) -> Result<Self, Error> {
        let [edge_name, ir_name, line_name] = region_names(process::id(), context_id);
        let ids = [
            ShMemId::try_from_str(&edge_name)?,
            ShMemId::try_from_str(&ir_name)?,
            ShMemId::try_from_str(&line_name)?,
        ];

        let edges = provider.new_shmem_with_id(EDGE_SHM_SIZE, &ids[0])?;
        let ir_edges = match provider.new_shmem_with_id(IR_SHM_SIZE, &ids[1]) {
            Ok(shmem) => shmem,
            Err(err) => {
                drop(edges);
                Self::unlink_all(&mut provider, &ids[..1]);
                return Err(err);
            }
        };
        let lines = match provider.new_shmem_with_id(LINE_SHM_SIZE, &ids[2]) {
            Ok(shmem) => shmem,
            Err(err) => {
                drop(edges);
                drop(ir_edges);
                Self::unlink_all(&mut provider, &ids[..2]);
                return Err(err);
            }
        };

        let channel = Self {
            provider,
            context_id,
            edges,
            ir_edges,
            lines,
            owner: true,
        };
        if let Err(err) = channel.validate() {
            if let Err(unlink_err) = channel.shutdown() {
                log::warn!("Could not remove coverage regions: {unlink_err}");
            }
            return Err(err);
        }
        log::info!("Created coverage regions {edge_name}, {ir_name}, {line_name}");
        Ok(channel)
    }

    /// Maps the regions named by the `SHM_ID*` env vars using `provider`.
    ///
    /// The regions stay alive after this side is dropped, only the creator unlinks them.
    pub fn attach_with_provider(mut provider: SP) -> Result<Self, Error> {
        let edges = provider.existing_from_env(SHM_ID_ENV, EDGE_SHM_SIZE)?;
        let ir_edges = provider.existing_from_env(SHM_ID3_ENV, IR_SHM_SIZE)?;
        let lines = provider.existing_from_env(SHM_ID4_ENV, LINE_SHM_SIZE)?;
        log::debug!("Attached to coverage regions {}", edges.id());

        let channel = Self {
            provider,
            context_id: 0,
            edges,
            ir_edges,
            lines,
            owner: false,
        };
        channel.validate()?;
        Ok(channel)
    }

    fn validate(&self) -> Result<(), Error> {
        EDGE_LAYOUT.validate(self.edges.len())?;
        IR_LAYOUT.validate(self.ir_edges.len())?;
        LINE_LAYOUT.validate(self.lines.len())
    }

    fn unlink_all(provider: &mut SP, ids: &[ShMemId]) -> Option<Error> {
        let mut first_err = None;
        for id in ids {
            if let Err(err) = provider.unlink(id) {
                log::warn!("Failed to unlink coverage region {id}: {err}");
                first_err.get_or_insert(err);
            }
        }
        first_err
    }

    /// The context id these regions were created for. `0` on the attaching side.
    #[must_use]
    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    /// `true` on the side that created the regions
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// The env vars the target needs to find these regions.
    #[must_use]
    pub fn env_vars(&self) -> [(&'static str, String); 3] {
        [
            (SHM_ID_ENV, self.edges.id().to_string()),
            (SHM_ID3_ENV, self.ir_edges.id().to_string()),
            (SHM_ID4_ENV, self.lines.id().to_string()),
        ]
    }

    /// The whole edge region, header included
    #[must_use]
    pub fn edges(&self) -> &[u8] {
        &self.edges
    }

    /// The whole edge region, header included, mutable
    pub fn edges_mut(&mut self) -> &mut [u8] {
        &mut self.edges
    }

    /// The live edge bitmap, without the header
    #[must_use]
    pub fn edge_bitmap(&self) -> &[u8] {
        &self.edges[EDGE_BITMAP_FIELD.offset..EDGE_BITMAP_FIELD.end()]
    }

    /// The live edge bitmap, without the header, mutable
    pub fn edge_bitmap_mut(&mut self) -> &mut [u8] {
        &mut self.edges[EDGE_BITMAP_FIELD.offset..EDGE_BITMAP_FIELD.end()]
    }

    /// The `num_edges` value the target reported, without the reserved index
    pub fn reported_edges(&self) -> Result<u32, Error> {
        EDGE_COUNT_FIELD.read_u32(&self.edges)
    }

    /// Writes the `num_edges` header, as the target's instrumentation does on startup
    pub fn set_reported_edges(&mut self, num_edges: u32) -> Result<(), Error> {
        EDGE_COUNT_FIELD.write_u32(&mut self.edges, num_edges)
    }

    /// The IR region
    #[must_use]
    pub fn ir_edges(&self) -> &[u8] {
        &self.ir_edges
    }

    /// The IR region, mutable
    pub fn ir_edges_mut(&mut self) -> &mut [u8] {
        &mut self.ir_edges
    }

    /// The line region
    #[must_use]
    pub fn lines(&self) -> &[u8] {
        &self.lines
    }

    /// The line region, mutable
    pub fn lines_mut(&mut self) -> &mut [u8] {
        &mut self.lines
    }

    /// Reads the edge count the target reported and sizes all evaluation state for it.
    ///
    /// Fails with [`Error::Fatal`] if the target reported no edges, or more than the edge region holds.
    /// In that case the regions are unlinked before returning.
    pub fn finish_initialization(
        self,
        should_track_edges: bool,
    ) -> Result<CoverageContext<SP>, Error> {
        let reported = self.reported_edges()?;
        match edge_sizes(reported) {
            Ok((num_edges, bitmap_size)) => Ok(CoverageContext::new(
                self,
                num_edges,
                bitmap_size,
                should_track_edges,
            )),
            Err(err) => {
                if let Err(unlink_err) = self.shutdown() {
                    log::warn!("Could not remove coverage regions: {unlink_err}");
                }
                Err(err)
            }
        }
    }

    /// Unmaps all regions and, on the creating side, unlinks their names.
    ///
    /// All three names are tried, the first failure is returned.
    pub fn shutdown(self) -> Result<(), Error> {
        let Self {
            mut provider,
            edges,
            ir_edges,
            lines,
            owner,
            ..
        } = self;
        let ids = [edges.id(), ir_edges.id(), lines.id()];
        drop(edges);
        drop(ir_edges);
        drop(lines);
        if !owner {
            return Ok(());
        }
        log::info!("Removing coverage regions {}", ids[0]);
        match Self::unlink_all(&mut provider, &ids) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, env, process, rc::Rc};

    use edgecov_bolts::{
        layout::set_bit,
        shmem::{NopShMem, NopShMemProvider, ShMemId, ShMemProvider},
        Error,
    };
    use serial_test::serial;

    use crate::{
        channel::{CoverageChannel, EDGE_LAYOUT},
        options::{region_names, SHM_ID_ENV},
        EDGE_HEADER_SIZE, EDGE_SHM_SIZE, IR_SHM_SIZE, LINE_SHM_SIZE,
    };

    /// Refuses to create its `fail_at`th region, and records every unlinked name.
    #[derive(Debug, Default)]
    struct FlakyProvider {
        created: usize,
        fail_at: usize,
        unlinked: Rc<RefCell<Vec<String>>>,
    }

    impl ShMemProvider for FlakyProvider {
        type ShMem = NopShMem;

        fn new() -> Result<Self, Error> {
            Ok(Self::default())
        }

        fn new_shmem_with_id(&mut self, map_size: usize, id: &ShMemId) -> Result<NopShMem, Error> {
            self.created += 1;
            if self.created == self.fail_at {
                return Err(Error::illegal_state(format!("Cannot create {id}")));
            }
            NopShMemProvider.new_shmem_with_id(map_size, id)
        }

        fn shmem_from_id_and_size(&mut self, id: &ShMemId, size: usize) -> Result<NopShMem, Error> {
            NopShMemProvider.shmem_from_id_and_size(id, size)
        }

        fn unlink(&mut self, id: &ShMemId) -> Result<(), Error> {
            self.unlinked.borrow_mut().push(id.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_partial_creation_unlinks_created_regions() {
        let [edge_name, ir_name, _] = region_names(process::id(), 9);
        for (fail_at, expected) in [
            (1, vec![]),
            (2, vec![edge_name.clone()]),
            (3, vec![edge_name.clone(), ir_name.clone()]),
        ] {
            let unlinked = Rc::new(RefCell::new(Vec::new()));
            let provider = FlakyProvider {
                fail_at,
                unlinked: Rc::clone(&unlinked),
                ..FlakyProvider::default()
            };
            assert!(CoverageChannel::with_provider(provider, 9).is_err());
            assert_eq!(*unlinked.borrow(), expected);
        }
    }

    #[test]
    fn test_region_sizes_and_views() -> Result<(), Error> {
        let mut channel = CoverageChannel::with_provider(NopShMemProvider::new()?, 5)?;
        assert_eq!(channel.edges().len(), EDGE_SHM_SIZE);
        assert_eq!(channel.edge_bitmap().len(), EDGE_SHM_SIZE - EDGE_HEADER_SIZE);
        assert_eq!(channel.ir_edges().len(), IR_SHM_SIZE);
        assert_eq!(channel.lines().len(), LINE_SHM_SIZE);
        assert_eq!(channel.context_id(), 5);
        assert!(channel.is_owner());

        channel.set_reported_edges(1234)?;
        assert_eq!(channel.reported_edges()?, 1234);
        set_bit(channel.edge_bitmap_mut(), 9);
        assert_eq!(channel.edges()[EDGE_HEADER_SIZE + 1], 0b10);
        // the header is not part of the bitmap
        assert_eq!(channel.edge_bitmap()[0], 0);

        assert_eq!(EDGE_LAYOUT.size(), EDGE_SHM_SIZE);
        channel.shutdown()
    }

    #[test]
    fn test_env_vars_name_regions() -> Result<(), Error> {
        let channel = CoverageChannel::with_provider(NopShMemProvider::new()?, 2)?;
        let pid = process::id();
        let vars = channel.env_vars();
        assert_eq!(vars[0], (SHM_ID_ENV, format!("shm_id_{pid}_2")));
        assert_eq!(vars[1].1, format!("shm_id_{pid}_2_3"));
        assert_eq!(vars[2].1, format!("shm_id_{pid}_2_4"));
        channel.shutdown()
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_target_side_sees_controller_writes() -> Result<(), Error> {
        let mut controller = CoverageChannel::initialize(0xc0)?;
        for (name, value) in controller.env_vars() {
            env::set_var(name, value);
        }

        let mut target = CoverageChannel::attach_from_env()?;
        assert!(!target.is_owner());
        target.set_reported_edges(77)?;
        set_bit(target.ir_edges_mut(), 12);
        target.lines_mut()[4..8].copy_from_slice(&5_i32.to_ne_bytes());

        assert_eq!(controller.reported_edges()?, 77);
        assert_eq!(controller.ir_edges()[1], 0b10000);
        assert_eq!(controller.lines()[4..8], 5_i32.to_ne_bytes());

        controller.edge_bitmap_mut()[0] = 0xff;
        assert_eq!(target.edge_bitmap()[0], 0xff);

        target.shutdown()?;
        controller.shutdown()?;
        assert!(CoverageChannel::attach_from_env().is_err());
        Ok(())
    }

    #[test]
    #[serial]
    #[cfg(unix)]
    #[cfg_attr(miri, ignore)]
    fn test_context_ids_do_not_collide() -> Result<(), Error> {
        let first = CoverageChannel::initialize(0xd0)?;
        assert!(CoverageChannel::initialize(0xd0).is_err());
        let second = CoverageChannel::initialize(0xd1)?;
        second.shutdown()?;
        first.shutdown()
    }

    #[test]
    #[serial]
    #[cfg(unix)]
    #[cfg_attr(miri, ignore)]
    fn test_taken_line_region_unlinks_earlier_regions() -> Result<(), Error> {
        use edgecov_bolts::shmem::StdShMemProvider;

        let [edge_name, ir_name, line_name] = region_names(process::id(), 0xe0);
        let mut provider = StdShMemProvider::new()?;
        let line_id = ShMemId::try_from_str(&line_name)?;
        let taken = provider.new_shmem_with_id(LINE_SHM_SIZE, &line_id)?;

        assert!(CoverageChannel::initialize(0xe0).is_err());
        let edge_id = ShMemId::try_from_str(&edge_name)?;
        let ir_id = ShMemId::try_from_str(&ir_name)?;
        assert!(provider.shmem_from_id_and_size(&edge_id, EDGE_SHM_SIZE).is_err());
        assert!(provider.shmem_from_id_and_size(&ir_id, IR_SHM_SIZE).is_err());

        drop(taken);
        provider.unlink(&line_id)?;
        // the names are free again
        CoverageChannel::initialize(0xe0)?.shutdown()
    }
}
