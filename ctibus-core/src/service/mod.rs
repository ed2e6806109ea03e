pub mod deletions;
pub mod distributed_lock;
pub mod edit_context;
pub mod event_builder;
pub mod playbook;
pub mod registry;
pub mod session;
pub mod work;

pub use deletions::{DeletionRegistry, DELETION_WINDOW_SECS};
pub use distributed_lock::{Lock, LockManager, LockOptions};
pub use edit_context::{EditContextService, EDIT_CONTEXT_TTL_SECS};
pub use event_builder::{
    generate_create_message, generate_delete_message, generate_merge_message, EventBuilder,
    JsonConverter, MergeImpacts, StixConverter,
};
pub use playbook::{
    PlaybookExecution, PlaybookExecutionService, PlaybookStep, PLAYBOOK_EXECUTION_TTL_SECS,
};
pub use registry::{EphemeralRegistry, RegistryEntry};
pub use session::SessionService;
pub use work::{WorkService, WorkStatus};
