//! Grouping index resolution.
//!
//! Turns raw group-label columns into canonical grouping factors and levels.
//! Nested factors key their levels by the parent level's key joined with the
//! child's raw label, so child labels that repeat across parents ("ward A" in
//! two different hospitals) become distinct levels.

mod index;
mod spec;

pub use index::{GroupingFactor, GroupingIndex, LevelRef};
pub use spec::{GroupingSpec, Nesting};
