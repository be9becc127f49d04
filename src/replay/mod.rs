pub mod replayer;
pub mod shadow;

pub use replayer::{MarketReplayer, ReplayController};
pub use shadow::{ShadowComparison, ShadowMode};
