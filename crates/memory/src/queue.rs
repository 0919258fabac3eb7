//! Persisted background task queue.
//!
//! Deferred work (fact extraction, consolidation) is queued as JSON rows in
//! `.task_queue.json` so it survives restarts.  Tasks retry up to a
//! configured attempt cap and are then marked permanently failed — still on
//! disk, still inspectable.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::MemoryStore;

pub const QUEUE_FILE: &str = ".task_queue.json";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    PermanentlyFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub attempts: Vec<TaskAttempt>,
    pub max_attempts: u32,
}

impl BackgroundTask {
    pub fn can_retry(&self) -> bool {
        matches!(self.status, TaskStatus::Queued | TaskStatus::Failed)
            && (self.attempts.len() as u32) < self.max_attempts
    }
}

pub struct TaskQueue {
    store: MemoryStore,
    tasks: Vec<BackgroundTask>,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn load(store: MemoryStore, max_attempts: u32) -> Result<Self> {
        let tasks = store.read_json_or_default(store.base().join(QUEUE_FILE))?;
        Ok(Self { store, tasks, max_attempts })
    }

    fn save(&self) -> Result<()> {
        self.store.write_json(self.store.base().join(QUEUE_FILE), &self.tasks)
    }

    pub fn add(
        &mut self,
        name: &str,
        description: &str,
        parameters: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<String> {
        let task = BackgroundTask {
            id: format!("task_{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            status: TaskStatus::Queued,
            created_at: at,
            attempts: Vec::new(),
            max_attempts: self.max_attempts,
        };
        let id = task.id.clone();
        self.tasks.push(task);
        self.save()?;
        info!(id, name, "background task queued");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<&BackgroundTask> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn all(&self) -> &[BackgroundTask] {
        &self.tasks
    }

    pub fn queued(&self) -> Vec<&BackgroundTask> {
        self.tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Queued)
            .collect()
    }

    /// Put a failed task back in the queue for another attempt.  Permanently
    /// failed tasks stay failed.
    pub fn retry(&mut self, id: &str) -> Result<bool> {
        let Some(task) = self.tasks.iter_mut().find(|task| task.id == id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Failed {
            return Ok(false);
        }
        task.status = TaskStatus::Queued;
        self.save()?;
        Ok(true)
    }

    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let before = self.tasks.len();
        self.tasks.retain(|task| task.id != id);
        let removed = self.tasks.len() < before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Record one execution attempt for `id` and update its status.  A task
    /// that exhausts its attempts is marked permanently failed and left
    /// inspectable.
    pub fn record_attempt(
        &mut self,
        id: &str,
        started: DateTime<Utc>,
        outcome: Result<()>,
    ) -> Result<()> {
        let Some(task) = self.tasks.iter_mut().find(|task| task.id == id) else {
            return Ok(());
        };
        let ended = Utc::now();
        match outcome {
            Ok(()) => {
                task.attempts.push(TaskAttempt { started, ended, error: None });
                task.status = TaskStatus::Completed;
            }
            Err(err) => {
                task.attempts.push(TaskAttempt {
                    started,
                    ended,
                    error: Some(err.to_string()),
                });
                if (task.attempts.len() as u32) >= task.max_attempts {
                    task.status = TaskStatus::PermanentlyFailed;
                    warn!(id = %task.id, name = %task.name, "task permanently failed");
                } else {
                    task.status = TaskStatus::Failed;
                    warn!(id = %task.id, name = %task.name, attempts = task.attempts.len(), "task failed; retry possible");
                }
            }
        }
        self.save()
    }

    /// Drain queued tasks through `executor`.  Returns how many completed.
    pub fn run_pending<F>(&mut self, mut executor: F) -> Result<usize>
    where
        F: FnMut(&BackgroundTask) -> Result<()>,
    {
        let pending: Vec<(String, usize)> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.status == TaskStatus::Queued)
            .map(|(i, task)| (task.id.clone(), i))
            .collect();
        let mut completed = 0;
        for (id, i) in pending {
            self.tasks[i].status = TaskStatus::Running;
            let started = Utc::now();
            let result = executor(&self.tasks[i]);
            let ok = result.is_ok();
            self.record_attempt(&id, started, result)?;
            if ok {
                completed += 1;
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use crate::store::MemoryStore;

    use super::{TaskQueue, TaskStatus};

    fn temp_queue() -> (MemoryStore, TaskQueue) {
        let base = std::env::temp_dir().join(format!("anima-queue-{}", Uuid::new_v4()));
        let store = MemoryStore::open(&base).unwrap();
        let queue = TaskQueue::load(store.clone(), 3).unwrap();
        (store, queue)
    }

    #[test]
    fn tasks_persist_across_reload() {
        let (store, mut queue) = temp_queue();
        let id = queue
            .add("fact_extraction", "extract facts from turn 7", json!({"turn": 7}), Utc::now())
            .unwrap();

        let reloaded = TaskQueue::load(store.clone(), 3).unwrap();
        let task = reloaded.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.parameters["turn"], 7);
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn successful_run_completes_task() {
        let (store, mut queue) = temp_queue();
        queue.add("noop", "does nothing", json!({}), Utc::now()).unwrap();
        let completed = queue.run_pending(|_| Ok(())).unwrap();
        assert_eq!(completed, 1);
        assert_eq!(queue.all()[0].status, TaskStatus::Completed);
        assert_eq!(queue.all()[0].attempts.len(), 1);
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn failures_retry_until_permanent() {
        let (store, mut queue) = temp_queue();
        let id = queue.add("flaky", "always fails", json!({}), Utc::now()).unwrap();

        for attempt in 1..=3 {
            queue.run_pending(|_| bail!("boom")).unwrap();
            let task = queue.get(&id).unwrap();
            assert_eq!(task.attempts.len(), attempt);
            if attempt < 3 {
                assert_eq!(task.status, TaskStatus::Failed);
                assert!(queue.retry(&id).unwrap());
            } else {
                assert_eq!(task.status, TaskStatus::PermanentlyFailed);
            }
        }

        // Permanently failed tasks cannot be re-queued and stay inspectable.
        assert!(!queue.retry(&id).unwrap());
        assert_eq!(queue.get(&id).unwrap().attempts[0].error.as_deref(), Some("boom"));
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn remove_deletes_by_id() {
        let (store, mut queue) = temp_queue();
        let id = queue.add("temp", "temporary", json!({}), Utc::now()).unwrap();
        assert!(queue.remove(&id).unwrap());
        assert!(!queue.remove(&id).unwrap());
        assert!(queue.get(&id).is_none());
        let _ = std::fs::remove_dir_all(store.base());
    }
}
