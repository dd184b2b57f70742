//! Identity, task, counter, and value vocabulary shared by the store,
//! handlers, and engine crates.

pub mod counters;
pub mod ids;
pub mod jobrun;
pub mod task;
pub mod value;

pub use counters::Counters;
pub use ids::{IdError, JobConfigId, JobRunId, ProjectId, TaskId};
pub use jobrun::{JobRun, JobRunStatus};
pub use task::{FailureType, Task, TaskStatus, TaskType};
pub use value::JsonMap;
