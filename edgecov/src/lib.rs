/*!
`edgecov` measures which control-flow edges an instrumented target exercised for the first time.

The target writes its live bitmaps into shared memory regions created by a [`channel::CoverageChannel`].
After every execution, a [`context::CoverageContext`] scans them against persistent virgin maps
and reports the newly discovered indices for three independent channels: edges, IR indices and crashes.

The target and this crate never touch the regions at the same time:
the execution driver strictly alternates "target runs" and "controller evaluates and clears".
Nothing in here locks or synchronizes.
*/
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
))]

pub mod channel;
pub mod context;
pub mod evaluator;
pub mod options;
pub mod state;
pub mod virgin;

pub use edgecov_bolts::Error;

/// Size of the edge region, header included
pub const EDGE_SHM_SIZE: usize = 0x100000;
/// Size of the IR region
pub const IR_SHM_SIZE: usize = 4096;
/// Size of the line region: one 4 byte slot per IR region byte
pub const LINE_SHM_SIZE: usize = 4 * IR_SHM_SIZE;
/// Bytes in front of the edge bitmap, holding `num_edges`
pub const EDGE_HEADER_SIZE: usize = 4;
/// The most edges the edge region can address, reserved index 0 included.
///
/// The bitmap is scanned in whole 64 bit words, so only the 8 byte aligned part after the header counts.
pub const MAX_EDGES: usize = ((EDGE_SHM_SIZE - EDGE_HEADER_SIZE) & !7) * 8;
