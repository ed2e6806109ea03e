pub mod event;
pub mod origin;

pub use event::{
    Commit, DeleteContext, EventKind, EventScope, EventType, MergeContext, PatchContext, SseEvent,
    StreamEvent, WireEvent, EVENT_ACTIVITY_VERSION, EVENT_CURRENT_VERSION,
};
pub use origin::{Actor, EventOrigin};

/// Generate a random opaque token (used for lock leases and node ids)
#[must_use]
pub fn generate_token() -> String {
    nanoid::nanoid!(21)
}
