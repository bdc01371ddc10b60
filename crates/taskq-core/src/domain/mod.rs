//! Domain model (identifiers, priorities, task references, messages, errors).

pub mod errors;
pub mod ids;
pub mod messages;
pub mod priority;
pub mod task;

pub use self::errors::{ErrorKind, QueueError, QueueResult};
pub use self::ids::{HintId, ProvisionerId, TaskId, WorkerType};
pub use self::messages::{ClaimMessage, DeadlineMessage, PendingMessage, ResolvedMessage, Resolution};
pub use self::priority::Priority;
pub use self::task::TaskRef;
