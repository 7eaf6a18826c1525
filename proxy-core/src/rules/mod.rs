//! Rule data model, generation snapshots, and the control-plane synchronizer
pub mod generation;
pub mod model;
pub mod sync;

pub use generation::{GenerationStore, RuleGeneration};
pub use model::{AuthMode, Destination, FastPathRule, PortSelector, Protocol, Rule, RuleAction, SlowPathRule};
pub use sync::Synchronizer;
