// packages/engine/src/runtime/experiment.rs
//! Experiments
//!
//! An experiment groups a fixed number of trials sharing identical inputs
//! and aggregates their status and progress. The experiment mutex guards
//! status, the trial map, the output set and the clonable-seed handoff;
//! step execution inside a trial never takes it. Cooperative control
//! (pause/stop/kill, pause-at targets, the inter-step delay) lives in
//! atomics checked by the worker at every step boundary, plus a condvar so
//! a sleeping worker wakes within one delay interval.

use crate::app::App;
use crate::attrs::Attributes;
use crate::graph::{GraphFactory, GraphType, Nodes};
use crate::inputs::ExpInputs;
use crate::model::ModelFactory;
use crate::output::Output;
use crate::project::Project;
use crate::runtime::exp_mgr::ProcessId;
use crate::runtime::trial::{Trial, TrialStatus};
use crate::utils::errors::{EngineError, Result};
use crate::utils::signals::Signal;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpStatus {
    Invalid,
    Unset,
    Ready,
    Queued,
    Running,
    Finished,
}

impl ExpStatus {
    /// Queued and Running forbid init, reset, output removal and
    /// destruction.
    pub fn is_busy(&self) -> bool {
        matches!(self, ExpStatus::Queued | ExpStatus::Running)
    }
}

/// Everything a worker needs to dispatch and step trials, resolved once at
/// init and immutable afterwards.
pub(crate) struct ExpSetup {
    pub model_factory: Arc<dyn ModelFactory>,
    pub graph_factory: Arc<dyn GraphFactory>,
    pub graph_type: GraphType,
    pub model_attrs: Attributes,
    pub graph_attrs: Attributes,
    pub nodes_cmd: String,
    pub num_trials: u16,
    pub stop_at: u64,
    /// Union of the cache column descriptors; empty means no file sinks.
    pub file_header: Vec<String>,
    /// `<outDir>/<projectName>_e<expId>_t`; the trial id is appended.
    pub path_prefix: Option<PathBuf>,
}

struct ExpState {
    status: ExpStatus,
    inputs: ExpInputs,
    setup: Option<Arc<ExpSetup>>,
    trials: BTreeMap<u16, Arc<Trial>>,
    /// The clonable seed: built by the first dispatched trial, moved into
    /// the last one.
    seed: Nodes,
    outputs: Vec<Arc<Output>>,
    last_error: String,
}

/// A set of identically-configured trials with aggregated status/progress.
pub struct Experiment {
    id: i32,
    project: Weak<Project>,
    app: Weak<App>,
    process_id: Mutex<Option<ProcessId>>,
    state: Mutex<ExpState>,

    pause_at: AtomicU64,
    stop_at: AtomicU64,
    pause_req: AtomicBool,
    stop_req: AtomicBool,
    kill_req: AtomicBool,
    auto_delete: AtomicBool,
    delay_ms: AtomicU64,
    progress: AtomicU16,

    park: Mutex<()>,
    park_cv: Condvar,

    pub status_changed: Signal<ExpStatus>,
    pub progress_updated: Signal<u16>,
    pub restarted: Signal<()>,
}

impl Experiment {
    pub(crate) fn new(
        app: &Arc<App>,
        project: &Arc<Project>,
        inputs: ExpInputs,
    ) -> Arc<Experiment> {
        let id = inputs.exp_id().unwrap_or(-1);
        Arc::new(Experiment {
            id,
            project: Arc::downgrade(project),
            app: Arc::downgrade(app),
            process_id: Mutex::new(None),
            state: Mutex::new(ExpState {
                status: ExpStatus::Invalid,
                inputs,
                setup: None,
                trials: BTreeMap::new(),
                seed: Nodes::new(),
                outputs: Vec::new(),
                last_error: String::new(),
            }),
            pause_at: AtomicU64::new(0),
            stop_at: AtomicU64::new(0),
            pause_req: AtomicBool::new(false),
            stop_req: AtomicBool::new(false),
            kill_req: AtomicBool::new(false),
            auto_delete: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            progress: AtomicU16::new(0),
            park: Mutex::new(()),
            park_cv: Condvar::new(),
            status_changed: Signal::new(),
            progress_updated: Signal::new(),
            restarted: Signal::new(),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn status(&self) -> ExpStatus {
        self.state.lock().expect("experiment state poisoned").status
    }

    /// Angular progress in [0, 360]; 360 iff Finished.
    pub fn progress(&self) -> u16 {
        self.progress.load(Ordering::Acquire)
    }

    /// Message of the most recent failure, empty when none.
    pub fn error(&self) -> String {
        self.state
            .lock()
            .expect("experiment state poisoned")
            .last_error
            .clone()
    }

    pub fn inputs(&self) -> ExpInputs {
        self.state
            .lock()
            .expect("experiment state poisoned")
            .inputs
            .clone()
    }

    pub fn num_trials(&self) -> u16 {
        let state = self.state.lock().expect("experiment state poisoned");
        state.setup.as_ref().map_or(0, |s| s.num_trials)
    }

    pub fn trial(&self, trial_id: u16) -> Option<Arc<Trial>> {
        let state = self.state.lock().expect("experiment state poisoned");
        state.trials.get(&trial_id).cloned()
    }

    pub fn trials(&self) -> Vec<Arc<Trial>> {
        let state = self.state.lock().expect("experiment state poisoned");
        state.trials.values().cloned().collect()
    }

    pub fn outputs(&self) -> Vec<Arc<Output>> {
        let state = self.state.lock().expect("experiment state poisoned");
        state.outputs.clone()
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete.load(Ordering::Acquire)
    }

    pub fn set_auto_delete(&self, on: bool) {
        self.auto_delete.store(on, Ordering::Release);
    }

    pub fn pause_at_step(&self) -> u64 {
        self.pause_at.load(Ordering::Acquire)
    }

    pub fn stop_at_step(&self) -> u64 {
        self.stop_at.load(Ordering::Acquire)
    }

    pub(crate) fn set_process_id(&self, pid: ProcessId) {
        *self.process_id.lock().expect("process id poisoned") = Some(pid);
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        *self.process_id.lock().expect("process id poisoned")
    }

    /// (Re-)initialize from the stored inputs. Rejected while Queued or
    /// Running; on failure the experiment is Invalid, no partial state is
    /// published, and the error is recorded.
    pub fn init(&self) -> Result<()> {
        let inputs = {
            let state = self.state.lock().expect("experiment state poisoned");
            if state.status.is_busy() {
                let msg = "tried to initialize a running experiment; pause it first".to_string();
                warn!(exp = self.id, "{}", msg);
                return Err(EngineError::Scheduling(msg));
            }
            state.inputs.clone()
        };

        match self.build_setup(&inputs) {
            Ok(setup) => {
                {
                    let mut state = self.state.lock().expect("experiment state poisoned");
                    state.setup = Some(Arc::new(setup));
                    state.last_error.clear();
                }
                self.reset()
            }
            Err(e) => {
                self.fail_init(&e);
                Err(e)
            }
        }
    }

    /// Replace the inputs and re-initialize. The edit path used by the
    /// project; rejected unless idle.
    pub fn set_inputs(&self, inputs: ExpInputs) -> Result<()> {
        {
            let mut state = self.state.lock().expect("experiment state poisoned");
            if state.status.is_busy() {
                let msg = "tried to edit a running experiment; pause it first".to_string();
                warn!(exp = self.id, "{}", msg);
                return Err(EngineError::Scheduling(msg));
            }
            state.inputs = inputs;
        }
        self.init()
    }

    fn fail_init(&self, error: &EngineError) {
        {
            let mut state = self.state.lock().expect("experiment state poisoned");
            state.setup = None;
            state.trials.clear();
            state.seed = Nodes::new();
            state.outputs.clear();
            state.status = ExpStatus::Invalid;
            state.last_error = error.to_string();
        }
        warn!(exp = self.id, error = %error, "experiment init failed");
        self.set_progress(0);
        self.status_changed.emit(&ExpStatus::Invalid);
    }

    fn build_setup(&self, inputs: &ExpInputs) -> Result<ExpSetup> {
        let graph_type = GraphType::parse(inputs.graph_type_raw())?;

        let num_trials = inputs.num_trials().ok_or_else(|| {
            EngineError::Config(format!(
                "number of trials must be in 1..={}",
                crate::MAX_TRIALS
            ))
        })?;
        let stop_at = inputs
            .stop_at()
            .ok_or_else(|| EngineError::Config("stopAt is missing".to_string()))?;

        let app = self
            .app
            .upgrade()
            .ok_or_else(|| EngineError::Config("the application is gone".to_string()))?;
        let model_factory = app
            .model(inputs.model_id())
            .ok_or_else(|| EngineError::UnknownPlugin {
                kind: "model",
                id: inputs.model_id().to_string(),
            })?;
        let graph_factory = app
            .graph(inputs.graph_id())
            .ok_or_else(|| EngineError::UnknownPlugin {
                kind: "graph",
                id: inputs.graph_id().to_string(),
            })?;

        inputs
            .model_attrs()
            .validate(&model_factory.attrs_scope())
            .map_err(|reason| EngineError::Config(format!("model inputs: {}", reason)))?;
        inputs
            .graph_attrs()
            .validate(&graph_factory.attrs_scope())
            .map_err(|reason| EngineError::Config(format!("graph inputs: {}", reason)))?;

        // Header: union of the cache column descriptors, order-preserving.
        let mut file_header: Vec<String> = Vec::new();
        for cache in inputs.caches() {
            for column in &cache.columns {
                if !file_header.contains(column) {
                    file_header.push(column.clone());
                }
            }
        }
        let path_prefix = if file_header.is_empty() {
            None
        } else {
            if inputs.out_dir().is_empty() {
                return Err(EngineError::Config(
                    "output columns require an output directory".to_string(),
                ));
            }
            let project_name = self
                .project
                .upgrade()
                .map_or_else(|| "project".to_string(), |p| p.name());
            Some(PathBuf::from(inputs.out_dir()).join(format!("{}_e{}_t", project_name, self.id)))
        };

        self.auto_delete.store(inputs.auto_delete(), Ordering::Release);

        Ok(ExpSetup {
            model_factory,
            graph_factory,
            graph_type,
            model_attrs: inputs.model_attrs().clone(),
            graph_attrs: inputs.graph_attrs().clone(),
            nodes_cmd: inputs.nodes_cmd().to_string(),
            num_trials,
            stop_at,
            file_header,
            path_prefix,
        })
    }

    /// Drop all trials and rebuild them Unset. Rejected while busy.
    pub fn reset(&self) -> Result<()> {
        let emit_progress;
        {
            let mut state = self.state.lock().expect("experiment state poisoned");
            if state.status.is_busy() {
                let msg = "tried to reset a running experiment; pause it first".to_string();
                warn!(exp = self.id, "{}", msg);
                return Err(EngineError::Scheduling(msg));
            }
            let setup = state
                .setup
                .clone()
                .ok_or_else(|| EngineError::Config("experiment is not initialized".to_string()))?;

            for output in &state.outputs {
                output.flush()?;
            }

            state.trials = (0..setup.num_trials)
                .map(|id| (id, Arc::new(Trial::new(id))))
                .collect();
            state.seed = Nodes::new();
            state.outputs = match setup.path_prefix.as_ref() {
                Some(prefix) => (0..setup.num_trials)
                    .map(|id| {
                        let mut path = prefix.as_os_str().to_os_string();
                        path.push(id.to_string());
                        Arc::new(Output::new(setup.file_header.clone(), PathBuf::from(path)))
                    })
                    .collect(),
                None => Vec::new(),
            };

            let delay = self
                .app
                .upgrade()
                .map_or(0, |app| app.default_step_delay_ms());
            self.delay_ms.store(delay, Ordering::Release);
            self.stop_at.store(setup.stop_at, Ordering::Release);
            self.pause_at.store(setup.stop_at, Ordering::Release);
            self.pause_req.store(false, Ordering::Release);
            self.stop_req.store(false, Ordering::Release);
            emit_progress = self.progress.swap(0, Ordering::AcqRel) != 0;

            state.status = ExpStatus::Ready;
        }

        debug!(exp = self.id, "experiment reset");
        self.status_changed.emit(&ExpStatus::Ready);
        if emit_progress {
            self.progress_updated.emit(&0);
        }
        self.restarted.emit(&());
        Ok(())
    }

    /// Drop the trials and the clonable seed.
    pub fn delete_trials(&self) {
        let mut state = self.state.lock().expect("experiment state poisoned");
        state.trials.clear();
        state.seed = Nodes::new();
    }

    /// Remove one output sink. The experiment must be idle and the sink
    /// flushed.
    pub fn remove_output(&self, output: &Arc<Output>) -> Result<()> {
        let mut state = self.state.lock().expect("experiment state poisoned");
        if state.status != ExpStatus::Ready {
            return Err(EngineError::Scheduling(
                "tried to remove an output from a non-idle experiment".to_string(),
            ));
        }
        if !output.is_empty() {
            return Err(EngineError::Scheduling(
                "tried to remove an output that still has pending rows".to_string(),
            ));
        }
        let before = state.outputs.len();
        state.outputs.retain(|o| !Arc::ptr_eq(o, output));
        if state.outputs.len() == before {
            return Err(EngineError::Scheduling(
                "tried to remove a non-existent output".to_string(),
            ));
        }
        Ok(())
    }

    // ---- control surface -------------------------------------------------

    /// Play, pause or dequeue depending on the current status.
    pub fn toggle(&self) {
        match self.status() {
            ExpStatus::Running => self.pause(),
            ExpStatus::Ready | ExpStatus::Finished => self.play(),
            ExpStatus::Queued => {
                if let (Some(app), Some(pid)) = (self.app.upgrade(), self.process_id()) {
                    app.exp_mgr().remove_from_queue(pid);
                }
            }
            _ => {}
        }
    }

    /// Enqueue with the manager. Valid from Ready and Finished; a no-op
    /// while Queued or Running (idempotent until a completion runs).
    pub fn play(&self) {
        self.play_until(self.stop_at.load(Ordering::Acquire));
    }

    /// Step all trials exactly once past the current maximum, then pause.
    pub fn play_next(&self) {
        if self.status() != ExpStatus::Ready {
            return;
        }
        let max_step = self
            .trials()
            .iter()
            .map(|t| t.step())
            .max()
            .unwrap_or(0);
        self.play_until(max_step + 1);
    }

    fn play_until(&self, pause_at: u64) {
        match self.status() {
            ExpStatus::Ready | ExpStatus::Finished => {}
            ExpStatus::Queued | ExpStatus::Running => {
                debug!(exp = self.id, "play ignored; already scheduled");
                return;
            }
            status => {
                warn!(exp = self.id, ?status, "tried to play an unplayable experiment");
                return;
            }
        }
        self.pause_req.store(false, Ordering::Release);
        self.stop_req.store(false, Ordering::Release);
        self.pause_at.store(pause_at, Ordering::Release);

        match (self.app.upgrade(), self.process_id()) {
            (Some(app), Some(pid)) => app.exp_mgr().play(pid),
            _ => warn!(exp = self.id, "experiment is not registered with the manager"),
        }
    }

    /// Honoured at the next step boundary; step counters are preserved.
    pub fn pause(&self) {
        match self.status() {
            ExpStatus::Running => {
                self.pause_req.store(true, Ordering::Release);
                self.park_cv.notify_all();
            }
            ExpStatus::Queued => {
                if let (Some(app), Some(pid)) = (self.app.upgrade(), self.process_id()) {
                    app.exp_mgr().remove_from_queue(pid);
                }
            }
            _ => {}
        }
    }

    /// Pause once every trial has reached `step`.
    pub fn set_pause_at(&self, step: u64) {
        let stop = self.stop_at.load(Ordering::Acquire);
        self.pause_at.store(step.min(stop), Ordering::Release);
        self.park_cv.notify_all();
    }

    /// Terminate at the next step boundary and leave the experiment
    /// Finished.
    pub fn stop(&self) {
        match self.status() {
            ExpStatus::Running => {
                self.stop_req.store(true, Ordering::Release);
                self.park_cv.notify_all();
            }
            ExpStatus::Queued => {
                if let (Some(app), Some(pid)) = (self.app.upgrade(), self.process_id()) {
                    app.exp_mgr().remove_from_queue(pid);
                }
            }
            _ => {}
        }
    }

    /// Lower the permanent stop target.
    pub fn set_stop_at(&self, step: u64) {
        self.stop_at.store(step, Ordering::Release);
        let _ = self
            .pause_at
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pause| {
                (pause > step).then_some(step)
            });
        self.park_cv.notify_all();
    }

    pub(crate) fn request_kill(&self) {
        self.kill_req.store(true, Ordering::Release);
        self.park_cv.notify_all();
    }

    pub(crate) fn kill_requested(&self) -> bool {
        self.kill_req.load(Ordering::Acquire)
    }

    /// Tear down regardless of project ownership: used when the manager
    /// destroys the experiment or the project is dropped.
    pub(crate) fn invalidate(&self) {
        self.request_kill();
        {
            let mut state = self.state.lock().expect("experiment state poisoned");
            state.trials.clear();
            state.seed = Nodes::new();
            state.outputs.clear();
            state.status = ExpStatus::Invalid;
        }
        self.set_progress(0);
        self.status_changed.emit(&ExpStatus::Invalid);
    }

    pub(crate) fn mark_queued(&self) {
        {
            let mut state = self.state.lock().expect("experiment state poisoned");
            if state.status.is_busy() {
                return;
            }
            state.status = ExpStatus::Queued;
        }
        self.status_changed.emit(&ExpStatus::Queued);
    }

    pub(crate) fn mark_dequeued(&self) {
        {
            let mut state = self.state.lock().expect("experiment state poisoned");
            if state.status != ExpStatus::Queued {
                return;
            }
            state.status = ExpStatus::Ready;
        }
        self.status_changed.emit(&ExpStatus::Ready);
    }

    /// Auto-delete epilogue run by the manager's completion handler: free
    /// the trials and return to Unset so `|trials| == numTrials` keeps
    /// holding for Finished experiments.
    pub(crate) fn auto_delete_cleanup(&self) {
        {
            let mut state = self.state.lock().expect("experiment state poisoned");
            if state.status != ExpStatus::Finished {
                return;
            }
            state.trials.clear();
            state.seed = Nodes::new();
            state.status = ExpStatus::Unset;
        }
        info!(exp = self.id, "auto-deleted trials after finish");
        self.set_progress(0);
        self.status_changed.emit(&ExpStatus::Unset);
    }

    // ---- worker side -----------------------------------------------------

    /// Worker entry point: sweep every live trial one step at a time until
    /// a control flag fires or everything reached its target. Runs on the
    /// manager's worker thread; all trials of this experiment are confined
    /// to that thread while it runs.
    pub(crate) fn process_steps(&self) {
        if self.kill_requested() {
            return;
        }
        // A pause consumed by a previous drain (e.g. a resize victim being
        // re-admitted) must not stop this run before it starts.
        self.pause_req.store(false, Ordering::Release);

        let (setup, trials, outputs) = {
            let mut state = self.state.lock().expect("experiment state poisoned");
            let Some(setup) = state.setup.clone() else {
                warn!(exp = self.id, "worker started without initialized setup");
                return;
            };
            state.status = ExpStatus::Running;
            let trials: Vec<Arc<Trial>> = state.trials.values().cloned().collect();
            let outputs = state.outputs.clone();
            (setup, trials, outputs)
        };
        self.status_changed.emit(&ExpStatus::Running);
        debug!(exp = self.id, trials = trials.len(), "experiment running");

        loop {
            if self.kill_requested() || self.stop_req.load(Ordering::Acquire) {
                break;
            }
            if self.pause_req.load(Ordering::Acquire) {
                break;
            }

            let target = self.pause_at.load(Ordering::Acquire);
            let mut progressed = false;

            for trial in &trials {
                match trial.status() {
                    TrialStatus::Unset => {
                        match self.nodes_for_trial(trial.id()) {
                            Ok(nodes) => {
                                let output = outputs.get(trial.id() as usize).cloned();
                                if let Err(e) = trial.dispatch(&setup, nodes, output) {
                                    self.record_error(&e);
                                } else {
                                    progressed = true;
                                }
                            }
                            Err(e) => {
                                trial.set_status(TrialStatus::Invalid);
                                self.record_error(&e);
                            }
                        }
                    }
                    TrialStatus::Ready => {
                        trial.set_status(TrialStatus::Running);
                    }
                    _ => {}
                }

                if trial.status() == TrialStatus::Running && trial.step() < target {
                    match trial.run_until(trial.step() + 1) {
                        Ok(()) => progressed = true,
                        Err(EngineError::Io(e)) => {
                            // Sink failure: record, mark the step
                            // incomplete and pause the experiment.
                            self.record_error(&EngineError::Io(e));
                            self.pause_req.store(true, Ordering::Release);
                        }
                        Err(e) => {
                            // The trial is already Invalid; siblings
                            // keep going.
                            self.record_error(&e);
                            progressed = true;
                        }
                    }
                }
            }

            self.update_progress(&trials);

            if !progressed {
                break;
            }
            let done = trials
                .iter()
                .all(|t| t.status().is_terminal() || t.step() >= target);
            if done {
                break;
            }

            let delay = self.delay_ms.load(Ordering::Acquire);
            if delay > 0 {
                let guard = self.park.lock().expect("park lock poisoned");
                let _ = self
                    .park_cv
                    .wait_timeout(guard, Duration::from_millis(delay))
                    .expect("park lock poisoned");
            }
        }

        if self.kill_requested() {
            debug!(exp = self.id, "worker observed kill; detaching");
            return;
        }
        self.finalize(&trials);
    }

    /// Decide the aggregate status at the end of a worker run and settle
    /// trial statuses at the boundary.
    fn finalize(&self, trials: &[Arc<Trial>]) {
        let stop = self.stop_at.load(Ordering::Acquire);
        let stopped = self.stop_req.load(Ordering::Acquire);

        for trial in trials {
            let status = trial.status();
            if status.is_terminal() {
                continue;
            }
            if stopped || (status != TrialStatus::Unset && trial.step() >= stop) {
                trial.set_status(TrialStatus::Finished);
            } else if status == TrialStatus::Running {
                trial.set_status(TrialStatus::Ready);
            }
        }

        for trial in trials {
            if let Err(e) = trial.sync_outputs() {
                self.record_error(&e);
            }
        }

        let all_terminal = !trials.is_empty() && trials.iter().all(|t| t.status().is_terminal());
        let any_finished = trials.iter().any(|t| t.status() == TrialStatus::Finished);
        // A zero-trial sweep (stopAt == 0 before dispatch) still finishes.
        let status = if trials.is_empty() {
            ExpStatus::Finished
        } else if all_terminal {
            if any_finished {
                ExpStatus::Finished
            } else {
                ExpStatus::Invalid
            }
        } else {
            ExpStatus::Ready
        };

        {
            let mut state = self.state.lock().expect("experiment state poisoned");
            state.status = status;
        }
        info!(exp = self.id, ?status, "experiment settled");
        self.update_progress(trials);
        self.status_changed.emit(&status);
    }

    /// Build, clone or move the node set for a dispatching trial. The scan
    /// for "am I the last unstarted trial" and the seed move are atomic
    /// under the experiment lock.
    pub(crate) fn nodes_for_trial(&self, trial_id: u16) -> Result<Nodes> {
        let mut state = self.state.lock().expect("experiment state poisoned");
        let setup = state
            .setup
            .clone()
            .ok_or_else(|| EngineError::Construction("experiment has no setup".to_string()))?;

        if state.seed.is_empty() {
            let nodes = Nodes::from_cmd(
                &setup.nodes_cmd,
                &setup.model_factory.node_attrs_scope(),
            )?;
            state.seed = nodes.clone();
            return Ok(nodes);
        }

        let another_pending = state
            .trials
            .values()
            .any(|t| t.id() != trial_id && t.status() == TrialStatus::Unset);
        if another_pending {
            Ok(state.seed.clone())
        } else {
            Ok(std::mem::take(&mut state.seed))
        }
    }

    /// True once the clonable seed has been built and not yet moved.
    pub fn has_seed(&self) -> bool {
        !self
            .state
            .lock()
            .expect("experiment state poisoned")
            .seed
            .is_empty()
    }

    fn record_error(&self, error: &EngineError) {
        warn!(exp = self.id, error = %error, "experiment error");
        let mut state = self.state.lock().expect("experiment state poisoned");
        state.last_error = error.to_string();
    }

    /// Progress = ceil(sum(step_i / pauseAt) * 360 / numTrials), clamped to
    /// [0, 360]; pinned to 360 when Finished and 0 when Invalid.
    fn update_progress(&self, trials: &[Arc<Trial>]) {
        let status = self.status();
        let value = match status {
            ExpStatus::Finished => 360,
            ExpStatus::Invalid => 0,
            ExpStatus::Running | ExpStatus::Ready => {
                let pause_at = self.pause_at.load(Ordering::Acquire).max(1);
                let n = trials.len().max(1);
                let sum: f64 = trials
                    .iter()
                    .map(|t| t.step() as f64 / pause_at as f64)
                    .sum();
                // 360 is reserved for Finished; a paused run that reached
                // its pause target reads 359.
                let value = (sum * 360.0 / n as f64).ceil().clamp(0.0, 360.0) as u16;
                value.min(359)
            }
            _ => return,
        };
        self.set_progress(value);
    }

    fn set_progress(&self, value: u16) {
        let last = self.progress.swap(value, Ordering::AcqRel);
        if last != value {
            self.progress_updated.emit(&value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::inputs::ExpInputs;
    use crate::utils::config::EngineConfig;

    fn app() -> Arc<App> {
        App::with_builtin_plugins(&EngineConfig {
            threads: 2,
            step_delay_ms: 0,
        })
    }

    fn make_exp(app: &Arc<App>, pairs: &[(&str, &str)]) -> Arc<Experiment> {
        let project = app.new_project("bench");
        let header: Vec<String> = pairs.iter().map(|(k, _)| k.to_string()).collect();
        let values: Vec<String> = pairs.iter().map(|(_, v)| v.to_string()).collect();
        let (inputs, _) = ExpInputs::parse(app, &header, &values).unwrap();
        project.new_experiment(inputs).unwrap()
    }

    fn base_pairs<'a>(trials: &'a str, stop_at: &'a str) -> Vec<(&'a str, &'a str)> {
        vec![
            ("id", "0"),
            ("trials", trials),
            ("stopAt", stop_at),
            ("nodes", "*5;min"),
            ("graphId", "line"),
            ("modelId", "identity"),
            ("graphType", "undirected"),
        ]
    }

    #[test]
    fn test_init_creates_trials() {
        let app = app();
        let exp = make_exp(&app, &base_pairs("3", "10"));
        assert_eq!(exp.status(), ExpStatus::Ready);
        assert_eq!(exp.trials().len(), 3);
        assert_eq!(exp.progress(), 0);
        assert!(exp.error().is_empty());
    }

    #[test]
    fn test_unknown_model_leaves_invalid_with_error() {
        let app = app();
        let mut pairs = base_pairs("1", "10");
        for pair in pairs.iter_mut() {
            if pair.0 == "modelId" {
                pair.1 = "marl";
            }
        }
        let exp = make_exp(&app, &pairs);
        assert_eq!(exp.status(), ExpStatus::Invalid);
        assert!(exp.error().contains("marl"));
        assert!(exp.trials().is_empty());
    }

    #[test]
    fn test_process_steps_runs_to_finish() {
        let app = app();
        let exp = make_exp(&app, &base_pairs("1", "10"));
        exp.process_steps();

        assert_eq!(exp.status(), ExpStatus::Finished);
        assert_eq!(exp.progress(), 360);
        let trial = exp.trial(0).unwrap();
        assert_eq!(trial.step(), 10);
        assert_eq!(trial.status(), TrialStatus::Finished);
    }

    #[test]
    fn test_stop_at_zero_finishes_with_zero_steps() {
        let app = app();
        let exp = make_exp(&app, &base_pairs("2", "0"));
        exp.process_steps();

        assert_eq!(exp.status(), ExpStatus::Finished);
        assert_eq!(exp.progress(), 360);
        for trial in exp.trials() {
            assert_eq!(trial.step(), 0);
            assert_eq!(trial.status(), TrialStatus::Finished);
        }
    }

    #[test]
    fn test_trials_interleave_one_step_per_sweep() {
        let app = app();
        let exp = make_exp(&app, &base_pairs("3", "100"));
        exp.set_pause_at(7);
        exp.process_steps();

        assert_eq!(exp.status(), ExpStatus::Ready);
        for trial in exp.trials() {
            assert_eq!(trial.step(), 7);
            assert_eq!(trial.status(), TrialStatus::Ready);
        }
    }

    #[test]
    fn test_pause_preserves_steps_and_play_target_resumes() {
        let app = app();
        let exp = make_exp(&app, &base_pairs("2", "50"));
        exp.set_pause_at(5);
        exp.process_steps();

        let steps: Vec<u64> = exp.trials().iter().map(|t| t.step()).collect();
        assert_eq!(steps, vec![5, 5]);
        assert_eq!(exp.status(), ExpStatus::Ready);

        // Resume to completion; no rewind, no double stepping.
        exp.set_pause_at(50);
        exp.process_steps();
        let steps: Vec<u64> = exp.trials().iter().map(|t| t.step()).collect();
        assert_eq!(steps, vec![50, 50]);
        assert_eq!(exp.status(), ExpStatus::Finished);
    }

    #[test]
    fn test_reset_rejected_while_running() {
        let app = app();
        let exp = make_exp(&app, &base_pairs("1", "10"));
        {
            let mut state = exp.state.lock().unwrap();
            state.status = ExpStatus::Running;
        }
        assert!(matches!(
            exp.reset(),
            Err(EngineError::Scheduling(_))
        ));
    }

    #[test]
    fn test_seed_is_moved_into_the_last_trial() {
        let app = app();
        let exp = make_exp(&app, &base_pairs("2", "10"));

        let first = exp.nodes_for_trial(0).unwrap();
        exp.trial(0).unwrap().set_status(TrialStatus::Running);
        assert!(exp.has_seed());

        let second = exp.nodes_for_trial(1).unwrap();
        assert!(!exp.has_seed(), "last trial must move, not clone");
        assert_eq!(first, second);
    }

    #[test]
    fn test_model_termination_finishes_early() {
        let app = app();
        let pairs = vec![
            ("id", "0"),
            ("trials", "1"),
            ("stopAt", "100"),
            ("nodes", "*4;min"),
            ("graphId", "cycle"),
            ("modelId", "aging"),
            ("graphType", "undirected"),
            ("aging_maxAge", "6"),
        ];
        let exp = make_exp(&app, &pairs);
        exp.process_steps();

        assert_eq!(exp.status(), ExpStatus::Finished);
        assert_eq!(exp.trial(0).unwrap().step(), 6);
    }

    #[test]
    fn test_shared_bad_descriptor_invalidates_experiment() {
        // Both trials share the malformed descriptor, so every dispatch
        // fails and the aggregation rule (all terminal, none Finished)
        // takes the whole experiment to Invalid.
        let app = app();
        let mut pairs = base_pairs("2", "10");
        for pair in pairs.iter_mut() {
            if pair.0 == "nodes" {
                pair.1 = "*bogus;min";
            }
        }
        let exp = make_exp(&app, &pairs);
        assert_eq!(exp.status(), ExpStatus::Ready);

        exp.process_steps();
        assert_eq!(exp.status(), ExpStatus::Invalid);
        for trial in exp.trials() {
            assert_eq!(trial.status(), TrialStatus::Invalid);
            assert_eq!(trial.step(), 0);
        }
        assert!(!exp.error().is_empty());
        assert_eq!(exp.progress(), 0);
    }

    #[test]
    fn test_invalid_trial_does_not_invalidate_siblings() {
        // One trial fails before stepping (as a failed dispatch would
        // leave it); its sibling keeps running and the experiment still
        // finishes.
        let app = app();
        let exp = make_exp(&app, &base_pairs("2", "10"));
        exp.trial(0).unwrap().set_status(TrialStatus::Invalid);

        exp.process_steps();

        let broken = exp.trial(0).unwrap();
        assert_eq!(broken.status(), TrialStatus::Invalid);
        assert_eq!(broken.step(), 0);

        let sibling = exp.trial(1).unwrap();
        assert_eq!(sibling.status(), TrialStatus::Finished);
        assert_eq!(sibling.step(), 10);

        assert_eq!(exp.status(), ExpStatus::Finished);
        assert_eq!(exp.progress(), 360);
    }

    #[test]
    fn test_output_files_have_header_and_step_rows() {
        let app = app();
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().to_str().unwrap().to_string();
        let mut pairs = base_pairs("1", "10");
        pairs.push(("outDir", out_dir.as_str()));
        pairs.push(("outColumns", "step;nodeCount"));
        let exp = make_exp(&app, &pairs);
        exp.process_steps();

        let path = dir.path().join("bench_e0_t0");
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "step,nodeCount");
        assert_eq!(lines.len(), 12, "header + steps 0..10");
        assert_eq!(lines[1], "0,5");
        assert_eq!(lines[11], "10,5");
    }

    #[test]
    fn test_progress_emitted_on_change() {
        use std::sync::atomic::AtomicUsize;

        let app = app();
        let exp = make_exp(&app, &base_pairs("1", "10"));
        let updates = Arc::new(AtomicUsize::new(0));
        let u = Arc::clone(&updates);
        exp.progress_updated.connect(move |_| {
            u.fetch_add(1, Ordering::SeqCst);
        });
        exp.process_steps();
        assert!(updates.load(Ordering::SeqCst) > 0);
        assert_eq!(exp.progress(), 360);
    }
}
