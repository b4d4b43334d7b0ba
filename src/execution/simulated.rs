//! Simulated Processing Service
//!
//! An in-process stand-in for the processing cluster. Each task finishes
//! after a configured number of status polls, and failures can be injected
//! per plugin type. Used by the CLI runtime and by tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

use super::external::{
    ProcessingError, ProcessingService, TaskRequest, TaskState, TaskStatus,
};
use crate::workflow::model::{ExecutionId, ExecutionProgress, PluginType};

#[derive(Debug)]
struct SimulatedTask {
    plugin_type: PluginType,
    polls: u32,
    polls_to_finish: u32,
    state: TaskState,
}

#[derive(Debug, Default)]
struct SimulationState {
    tasks: HashMap<String, SimulatedTask>,
    submissions: Vec<(ExecutionId, PluginType)>,
    running: HashMap<PluginType, usize>,
    peak_running: HashMap<PluginType, usize>,
    cancelled: Vec<String>,
}

/// Processing service that completes tasks after a number of polls.
#[derive(Debug)]
pub struct SimulatedProcessingService {
    polls_to_finish: u32,
    poll_overrides: HashMap<PluginType, u32>,
    failing: HashSet<PluginType>,
    stalled: HashSet<PluginType>,
    records_per_task: u64,
    unavailable: AtomicBool,
    state: Mutex<SimulationState>,
}

impl Default for SimulatedProcessingService {
    fn default() -> Self {
        Self::new(2)
    }
}

impl SimulatedProcessingService {
    /// Creates a service whose tasks finish on the given poll.
    pub fn new(polls_to_finish: u32) -> Self {
        Self {
            polls_to_finish: polls_to_finish.max(1),
            poll_overrides: HashMap::new(),
            failing: HashSet::new(),
            stalled: HashSet::new(),
            records_per_task: 100,
            unavailable: AtomicBool::new(false),
            state: Mutex::new(SimulationState::default()),
        }
    }

    /// Tasks of this type end in failure.
    pub fn failing(mut self, plugin_type: PluginType) -> Self {
        self.failing.insert(plugin_type);
        self
    }

    /// Tasks of this type never finish and report no progress.
    pub fn stalled(mut self, plugin_type: PluginType) -> Self {
        self.stalled.insert(plugin_type);
        self
    }

    /// Overrides the number of polls for one type.
    pub fn with_polls(mut self, plugin_type: PluginType, polls: u32) -> Self {
        self.poll_overrides.insert(plugin_type, polls.max(1));
        self
    }

    pub fn with_records_per_task(mut self, records: u64) -> Self {
        self.records_per_task = records;
        self
    }

    /// Makes every call fail as unreachable until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every submission so far, in order.
    pub fn submissions(&self) -> Vec<(ExecutionId, PluginType)> {
        self.state()
            .map(|s| s.submissions.clone())
            .unwrap_or_default()
    }

    /// Submissions for one execution.
    pub fn submitted_types(&self, execution_id: ExecutionId) -> Vec<PluginType> {
        self.submissions()
            .into_iter()
            .filter(|(id, _)| *id == execution_id)
            .map(|(_, t)| t)
            .collect()
    }

    /// Highest number of simultaneously running tasks of a type.
    pub fn peak_running(&self, plugin_type: PluginType) -> usize {
        self.state()
            .ok()
            .and_then(|s| s.peak_running.get(&plugin_type).copied())
            .unwrap_or(0)
    }

    /// Task ids that received a cancel request.
    pub fn cancelled_tasks(&self) -> Vec<String> {
        self.state().map(|s| s.cancelled.clone()).unwrap_or_default()
    }

    fn state(&self) -> Result<MutexGuard<'_, SimulationState>, ProcessingError> {
        self.state
            .lock()
            .map_err(|_| ProcessingError::Unavailable("simulation state poisoned".to_string()))
    }

    fn check_available(&self) -> Result<(), ProcessingError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProcessingError::Unavailable(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

fn finish_running(state: &mut SimulationState, plugin_type: PluginType) {
    if let Some(count) = state.running.get_mut(&plugin_type) {
        *count = count.saturating_sub(1);
    }
}

#[async_trait]
impl ProcessingService for SimulatedProcessingService {
    async fn submit(&self, request: &TaskRequest) -> Result<String, ProcessingError> {
        self.check_available()?;
        let task_id = Uuid::new_v4().to_string();
        let polls_to_finish = self
            .poll_overrides
            .get(&request.plugin_type)
            .copied()
            .unwrap_or(self.polls_to_finish);

        let mut state = self.state()?;
        state
            .submissions
            .push((request.execution_id, request.plugin_type));
        let running = state.running.entry(request.plugin_type).or_insert(0);
        *running += 1;
        let now_running = *running;
        let peak = state.peak_running.entry(request.plugin_type).or_insert(0);
        *peak = (*peak).max(now_running);
        state.tasks.insert(
            task_id.clone(),
            SimulatedTask {
                plugin_type: request.plugin_type,
                polls: 0,
                polls_to_finish,
                state: TaskState::Running,
            },
        );

        debug!(
            "Simulated {} task {} for execution {}",
            request.plugin_type, task_id, request.execution_id
        );
        Ok(task_id)
    }

    async fn poll_status(&self, task_id: &str) -> Result<TaskStatus, ProcessingError> {
        self.check_available()?;
        let mut state = self.state()?;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ProcessingError::Rejected(format!("unknown task {}", task_id)))?;

        let plugin_type = task.plugin_type;
        let mut became_terminal = false;
        if task.state == TaskState::Running && !self.stalled.contains(&plugin_type) {
            task.polls += 1;
            if task.polls >= task.polls_to_finish {
                task.state = if self.failing.contains(&plugin_type) {
                    TaskState::Failed(format!("{} failed on simulated records", plugin_type))
                } else {
                    TaskState::Finished
                };
                became_terminal = true;
            }
        }

        let processed =
            self.records_per_task * u64::from(task.polls.min(task.polls_to_finish))
                / u64::from(task.polls_to_finish);
        let status = TaskStatus {
            state: task.state.clone(),
            progress: ExecutionProgress {
                processed_records: processed,
                error_records: 0,
            },
            output_location: (task.state == TaskState::Finished)
                .then(|| format!("sim://{}", task_id)),
        };

        if became_terminal {
            finish_running(&mut state, plugin_type);
        }
        Ok(status)
    }

    async fn cancel(&self, task_id: &str) -> Result<(), ProcessingError> {
        self.check_available()?;
        let mut state = self.state()?;
        state.cancelled.push(task_id.to_string());
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(());
        };
        if task.state == TaskState::Running {
            task.state = TaskState::Cancelled;
            let plugin_type = task.plugin_type;
            finish_running(&mut state, plugin_type);
        }
        Ok(())
    }
}
