//! Per-pair synchronization stages.
//!
//! A pair moves through [`GapDetector`] → [`Backfiller`] → [`ForwardFiller`],
//! with every write going through [`UpsertWriter`]. [`SymbolSyncer`] runs
//! once per run before any pair is processed.

pub mod backfill;
pub mod forward_fill;
pub mod gaps;
pub mod symbols;
pub mod writer;

pub use backfill::{BackfillReport, Backfiller};
pub use forward_fill::{ForwardFillReport, ForwardFiller};
pub use gaps::{expected_grid, find_gaps, GapDetector, SyncCursor};
pub use symbols::{SymbolSyncReport, SymbolSyncer};
pub use writer::UpsertWriter;
