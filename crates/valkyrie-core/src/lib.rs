// valkyrie-core: Resource hierarchy over valkyrie-api — ports, streams,
// modifiers, filters, payload trackers, capture and the tshark bridge.

pub mod alloc;
pub mod capture;
pub mod error;
pub mod object;
pub mod port;
pub mod stream;
pub mod tshark;

// ── Primary re-exports ──────────────────────────────────────────────
pub use alloc::TpldAllocator;
pub use capture::{Capture, CaptureBufferType, CapturePacket};
pub use error::CoreError;
pub use object::{zip_stat_counters, ResourceNode};
pub use port::{
    Filter, Port, Tpld, FILTER_STATS_CAPTIONS, PORT_STATS_GROUPS, TPLD_STATS_GROUPS,
};
pub use stream::{Modifier, ModifierAction, ModifierKind, ModifierSpec, Stream, StreamState};
pub use tshark::{Tshark, TsharkAnalyzer};
