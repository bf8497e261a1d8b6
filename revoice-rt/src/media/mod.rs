//! Media layer: workspace handling and transcoder-backed operations

pub mod combiner;
pub mod reference;
pub mod separator;
pub mod toolkit;
pub mod workspace;

pub use combiner::{Combiner, CombinerConfig};
pub use reference::{ReferenceBuilder, ReferencePolicy};
pub use separator::{SeparatedStems, Separator};
pub use toolkit::{AudioFilter, AudioParams, MixInput, Toolkit};
pub use workspace::Workspace;
