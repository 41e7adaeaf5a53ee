pub use crate::ds::{Gate, IntervalHeap};
pub use crate::error::{AcquireError, ConfigError, InvariantError, PinError};
pub use crate::pipeline::{PausedPipeline, Pipeline, Residency};
pub use crate::tier::{TierPhase, TierStats};
pub use crate::token::{ReadGuard, Token, TokenHandle};
pub use crate::traits::{NullAdapter, Priority, ResourceAdapter};
