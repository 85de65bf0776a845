use crate::core::model::{TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Started,
    Stopped,
    Paused,
    Resumed,
    TaskStarted { task_id: TaskId, url: String },
    /// `status` is `None` when the row vanished mid-run (deleted or wiped).
    TaskFinished { task_id: TaskId, status: Option<TaskStatus> },
    TaskCrashed { task_id: TaskId, message: String },
    QueueWiped,
    Error { scope: String, message: String },
}
