pub mod agent;
pub mod events;
pub mod lock;
pub mod workspace;

pub use agent::{AgentError, AgentLoop, AgentTurn, TurnStatus};
pub use events::{AgentEvent, AgentRuntime, AgentStream, EventEmitter, EventEnvelope};
pub use lock::{LockError, LockGuard, LockHolder, LockToken, WorkspaceLock};
pub use workspace::{Workspace, WorkspaceError, WorkspaceManager};
