//! Wire-level pieces shared by the engine: transfer-coding state machine,
//! per-exchange context flags, and header byte-offset bookkeeping.

pub mod codec;
pub mod context;
pub mod header;

pub use codec::{ChunkResult, ChunkedState, TransferCoding};
pub use context::Context;
pub use header::HeaderIndex;
