// packages/engine/src/runtime/exp_mgr.rs
//! Experiments manager
//!
//! Schedules experiments (one process each) across a bounded pool of OS
//! worker threads with FIFO admission:
//!
//! ```text
//! play(id) ──▶ running (≤ threads) ──▶ worker thread ──▶ completion
//!                 │                                          │
//!                 └──────── queued (FIFO) ◀─── resize ───────┘
//! ```
//!
//! Workers report completion over a channel drained by a supervisor
//! thread, which serializes all state transitions on the manager mutex:
//! deferred kills are destroyed there, re-queued resize victims go back to
//! the queue front there, and the next queued process is admitted there.

use crate::runtime::experiment::Experiment;
use crate::utils::signals::Signal;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// The scheduler's handle to one experiment.
pub type ProcessId = i32;

enum CtrlMsg {
    Finished(ProcessId),
    Shutdown,
}

struct MgrState {
    processes: BTreeMap<ProcessId, Arc<Experiment>>,
    running: Vec<ProcessId>,
    queued: VecDeque<ProcessId>,
    to_kill: HashSet<ProcessId>,
    /// Resize victims, in their original running order; the completion
    /// handler moves them to the queue front.
    requeue: Vec<ProcessId>,
    threads: usize,
}

/// Bounded worker pool scheduling experiments.
pub struct ExperimentsMgr {
    state: Mutex<MgrState>,
    idle: Condvar,
    tx: Sender<CtrlMsg>,
    supervisor: Mutex<Option<JoinHandle<()>>>,

    pub new_process: Signal<ProcessId>,
    pub killed: Signal<ProcessId>,
}

enum KillOutcome {
    Deferred(Arc<Experiment>),
    Destroy(Arc<Experiment>),
    Unknown,
}

impl ExperimentsMgr {
    /// Create the manager with a worker cap. Zero is allowed: nothing is
    /// admitted until the cap is raised.
    pub fn new(threads: usize) -> Arc<ExperimentsMgr> {
        let (tx, rx) = unbounded();
        let mgr = Arc::new_cyclic(|weak: &Weak<ExperimentsMgr>| ExperimentsMgr {
            state: Mutex::new(MgrState {
                processes: BTreeMap::new(),
                running: Vec::new(),
                queued: VecDeque::new(),
                to_kill: HashSet::new(),
                requeue: Vec::new(),
                threads,
            }),
            idle: Condvar::new(),
            tx,
            supervisor: Mutex::new(Some(Self::spawn_supervisor(weak.clone(), rx))),
            new_process: Signal::new(),
            killed: Signal::new(),
        });
        info!(threads, "experiments manager started");
        mgr
    }

    fn spawn_supervisor(weak: Weak<ExperimentsMgr>, rx: Receiver<CtrlMsg>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("exp-mgr-supervisor".to_string())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        CtrlMsg::Finished(id) => match weak.upgrade() {
                            Some(mgr) => mgr.handle_finished(id),
                            None => break,
                        },
                        CtrlMsg::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn the supervisor thread")
    }

    /// Register an experiment and assign its process id (monotonic from
    /// the current maximum).
    pub fn add(&self, exp: &Arc<Experiment>) -> ProcessId {
        let id = {
            let mut state = self.state.lock().expect("manager state poisoned");
            let id = state
                .processes
                .last_key_value()
                .map_or(0, |(last, _)| last + 1);
            state.processes.insert(id, Arc::clone(exp));
            id
        };
        exp.set_process_id(id);
        debug!(process = id, exp = exp.id(), "process registered");
        self.new_process.emit(&id);
        id
    }

    /// Admit a process or queue it. Unknown ids are a warning; playing a
    /// process that is already running or queued is a no-op.
    pub fn play(&self, id: ProcessId) {
        enum Admission {
            Spawn(Arc<Experiment>),
            Queue(Arc<Experiment>),
            None,
        }

        let admission = {
            let mut state = self.state.lock().expect("manager state poisoned");
            if state.running.contains(&id) || state.queued.contains(&id) {
                debug!(process = id, "play ignored; already scheduled");
                Admission::None
            } else {
                match state.processes.get(&id).cloned() {
                    None => {
                        warn!(process = id, "tried to play a nonexistent process");
                        Admission::None
                    }
                    Some(exp) => {
                        if state.threads > 0 && state.running.len() < state.threads {
                            state.running.push(id);
                            Admission::Spawn(exp)
                        } else {
                            state.queued.push_back(id);
                            Admission::Queue(exp)
                        }
                    }
                }
            }
        };

        match admission {
            Admission::Spawn(exp) => {
                exp.mark_queued();
                self.spawn_worker(id, exp);
            }
            Admission::Queue(exp) => exp.mark_queued(),
            Admission::None => {}
        }
    }

    fn spawn_worker(&self, id: ProcessId, exp: Arc<Experiment>) {
        let tx = self.tx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("experiment-{}", id))
            .spawn(move || {
                exp.process_steps();
                let _ = tx.send(CtrlMsg::Finished(id));
            });
        if let Err(e) = spawned {
            error!(process = id, error = %e, "failed to spawn a worker");
            self.handle_finished(id);
        }
    }

    /// Completion handler, run on the supervisor thread.
    fn handle_finished(&self, id: ProcessId) {
        enum Epilogue {
            Killed(Arc<Experiment>),
            Requeued(Arc<Experiment>),
            AutoDelete(Arc<Experiment>),
            None,
        }

        let (epilogue, admitted, idle) = {
            let mut state = self.state.lock().expect("manager state poisoned");
            state.running.retain(|p| *p != id);

            let epilogue = if state.to_kill.remove(&id) {
                state.queued.retain(|p| *p != id);
                state.requeue.retain(|p| *p != id);
                match state.processes.remove(&id) {
                    Some(exp) => Epilogue::Killed(exp),
                    None => Epilogue::None,
                }
            } else if let Some(pos) = state.requeue.iter().position(|p| *p == id) {
                match state.processes.get(&id).cloned() {
                    Some(exp) => {
                        // Front of the queue, behind victims that were
                        // ahead of this one in the running order; the
                        // requeue list keeps that order until re-admission.
                        let insert_at = state
                            .queued
                            .iter()
                            .take_while(|q| {
                                state
                                    .requeue
                                    .iter()
                                    .position(|r| r == *q)
                                    .map_or(false, |earlier| earlier < pos)
                            })
                            .count();
                        state.queued.insert(insert_at, id);
                        Epilogue::Requeued(exp)
                    }
                    None => Epilogue::None,
                }
            } else {
                match state.processes.get(&id) {
                    Some(exp) if exp.auto_delete() => Epilogue::AutoDelete(Arc::clone(exp)),
                    _ => Epilogue::None,
                }
            };

            let admitted = Self::admit_from_queue(&mut state);
            let idle = state.running.is_empty() && state.queued.is_empty();
            (epilogue, admitted, idle)
        };

        match epilogue {
            Epilogue::Killed(exp) => {
                info!(process = id, "destroying killed process");
                exp.invalidate();
                self.killed.emit(&id);
            }
            Epilogue::Requeued(exp) => exp.mark_queued(),
            Epilogue::AutoDelete(exp) => exp.auto_delete_cleanup(),
            Epilogue::None => {}
        }
        for (next, exp) in admitted {
            debug!(process = next, "admitted from queue");
            self.spawn_worker(next, exp);
        }
        if idle {
            self.idle.notify_all();
        }
    }

    fn admit_from_queue(state: &mut MgrState) -> Vec<(ProcessId, Arc<Experiment>)> {
        let mut admitted = Vec::new();
        while state.threads > 0 && state.running.len() < state.threads {
            let Some(next) = state.queued.pop_front() else {
                break;
            };
            // Entries killed while queued have already left `processes`.
            state.requeue.retain(|p| *p != next);
            if let Some(exp) = state.processes.get(&next).cloned() {
                state.running.push(next);
                admitted.push((next, exp));
            }
        }
        admitted
    }

    /// Adjust the worker cap. Growing admits from the queue head; shrinking
    /// pauses the tail-most running processes and re-queues them at the
    /// front once their workers drain.
    pub fn set_threads(&self, threads: usize) {
        let (to_pause, admitted) = {
            let mut state = self.state.lock().expect("manager state poisoned");
            if state.threads == threads {
                return;
            }
            let old = state.threads;
            state.threads = threads;
            info!(old, new = threads, "worker cap resized");

            if threads > old {
                (Vec::new(), Self::admit_from_queue(&mut state))
            } else {
                let excess = state.running.len().saturating_sub(threads);
                let victims: Vec<ProcessId> = state
                    .running
                    .iter()
                    .rev()
                    .take(excess)
                    .rev()
                    .copied()
                    .collect();
                let mut to_pause = Vec::new();
                for id in victims {
                    if !state.requeue.contains(&id) {
                        state.requeue.push(id);
                    }
                    if let Some(exp) = state.processes.get(&id) {
                        to_pause.push(Arc::clone(exp));
                    }
                }
                (to_pause, Vec::new())
            }
        };

        for exp in to_pause {
            exp.pause();
        }
        for (id, exp) in admitted {
            self.spawn_worker(id, exp);
        }
    }

    /// Deferred destruction: a running process is marked and destroyed by
    /// the completion handler; anything else is destroyed immediately.
    /// `killed` is emitted exactly once either way.
    pub fn kill(&self, id: ProcessId) {
        let outcome = {
            let mut state = self.state.lock().expect("manager state poisoned");
            state.queued.retain(|p| *p != id);
            if state.running.is_empty() && state.queued.is_empty() {
                self.idle.notify_all();
            }
            if state.running.contains(&id) {
                state.to_kill.insert(id);
                match state.processes.get(&id).cloned() {
                    Some(exp) => KillOutcome::Deferred(exp),
                    None => KillOutcome::Unknown,
                }
            } else {
                state.to_kill.remove(&id);
                state.requeue.retain(|p| *p != id);
                match state.processes.remove(&id) {
                    Some(exp) => KillOutcome::Destroy(exp),
                    None => KillOutcome::Unknown,
                }
            }
        };

        match outcome {
            KillOutcome::Deferred(exp) => {
                debug!(process = id, "kill deferred until the worker detaches");
                exp.request_kill();
            }
            KillOutcome::Destroy(exp) => {
                info!(process = id, "process destroyed");
                exp.invalidate();
                self.killed.emit(&id);
            }
            KillOutcome::Unknown => warn!(process = id, "tried to kill a nonexistent process"),
        }
    }

    pub fn kill_all(&self) {
        let ids: Vec<ProcessId> = {
            let state = self.state.lock().expect("manager state poisoned");
            state.processes.keys().copied().collect()
        };
        for id in ids {
            self.kill(id);
        }
    }

    /// Drop a queued process back to Ready.
    pub fn remove_from_queue(&self, id: ProcessId) {
        let exp = {
            let mut state = self.state.lock().expect("manager state poisoned");
            let was_queued = state.queued.contains(&id);
            state.queued.retain(|p| *p != id);
            state.requeue.retain(|p| *p != id);
            if state.running.is_empty() && state.queued.is_empty() {
                self.idle.notify_all();
            }
            if was_queued {
                state.processes.get(&id).cloned()
            } else {
                None
            }
        };
        if let Some(exp) = exp {
            exp.mark_dequeued();
        }
    }

    fn running_exp(&self, id: ProcessId) -> Option<Arc<Experiment>> {
        let state = self.state.lock().expect("manager state poisoned");
        if state.running.contains(&id) {
            state.processes.get(&id).cloned()
        } else {
            None
        }
    }

    /// Cooperative controls, forwarded iff the process is running.
    pub fn pause(&self, id: ProcessId) {
        if let Some(exp) = self.running_exp(id) {
            exp.pause();
        }
    }

    pub fn pause_at(&self, id: ProcessId, step: u64) {
        if let Some(exp) = self.running_exp(id) {
            exp.set_pause_at(step);
        }
    }

    pub fn stop(&self, id: ProcessId) {
        if let Some(exp) = self.running_exp(id) {
            exp.stop();
        }
    }

    pub fn stop_at(&self, id: ProcessId, step: u64) {
        if let Some(exp) = self.running_exp(id) {
            exp.set_stop_at(step);
        }
    }

    /// Block until nothing is running or queued.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock().expect("manager state poisoned");
        while !(state.running.is_empty() && state.queued.is_empty()) {
            state = self.idle.wait(state).expect("manager state poisoned");
        }
    }

    pub fn threads(&self) -> usize {
        self.state.lock().expect("manager state poisoned").threads
    }

    pub fn process(&self, id: ProcessId) -> Option<Arc<Experiment>> {
        let state = self.state.lock().expect("manager state poisoned");
        state.processes.get(&id).cloned()
    }

    pub fn process_ids(&self) -> Vec<ProcessId> {
        let state = self.state.lock().expect("manager state poisoned");
        state.processes.keys().copied().collect()
    }

    pub fn running_ids(&self) -> Vec<ProcessId> {
        self.state
            .lock()
            .expect("manager state poisoned")
            .running
            .clone()
    }

    pub fn queued_ids(&self) -> Vec<ProcessId> {
        let state = self.state.lock().expect("manager state poisoned");
        state.queued.iter().copied().collect()
    }
}

impl Drop for ExperimentsMgr {
    fn drop(&mut self) {
        self.kill_all();
        let _ = self.tx.send(CtrlMsg::Shutdown);
        if let Some(handle) = self
            .supervisor
            .lock()
            .expect("supervisor handle poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::inputs::ExpInputs;
    use crate::runtime::experiment::ExpStatus;
    use crate::utils::config::EngineConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn app(threads: usize, step_delay_ms: u64) -> Arc<App> {
        App::with_builtin_plugins(&EngineConfig {
            threads,
            step_delay_ms,
        })
    }

    fn make_exp(app: &Arc<App>, exp_id: i32, stop_at: u64) -> Arc<Experiment> {
        let project = app.new_project("sched");
        let pairs = [
            ("id", exp_id.to_string()),
            ("trials", "1".to_string()),
            ("stopAt", stop_at.to_string()),
            ("nodes", "*4;min".to_string()),
            ("graphId", "line".to_string()),
            ("modelId", "identity".to_string()),
            ("graphType", "undirected".to_string()),
        ];
        let header: Vec<String> = pairs.iter().map(|(k, _)| k.to_string()).collect();
        let values: Vec<String> = pairs.iter().map(|(_, v)| v.clone()).collect();
        let (inputs, _) = ExpInputs::parse(app, &header, &values).unwrap();
        project.new_experiment(inputs).unwrap()
    }

    fn wait_until<F: Fn() -> bool>(pred: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        pred()
    }

    #[test]
    fn test_play_runs_to_completion() {
        let app = app(2, 0);
        let exp = make_exp(&app, 0, 10);
        exp.play();
        app.exp_mgr().wait_idle();
        assert_eq!(exp.status(), ExpStatus::Finished);
        assert_eq!(exp.progress(), 360);
    }

    #[test]
    fn test_fifo_queue_respects_thread_cap() {
        let app = app(1, 2);
        let mgr = app.exp_mgr();
        let exps: Vec<_> = (0..3).map(|i| make_exp(&app, i, 40)).collect();
        for exp in &exps {
            exp.play();
        }

        assert!(mgr.running_ids().len() <= 1);
        let queued = mgr.queued_ids();
        assert_eq!(queued.len(), 2);
        for id in mgr.running_ids() {
            assert!(!queued.contains(&id), "running and queued must be disjoint");
        }

        mgr.wait_idle();
        for exp in &exps {
            assert_eq!(exp.status(), ExpStatus::Finished);
        }
    }

    #[test]
    fn test_repeated_play_is_idempotent() {
        let app = app(1, 2);
        let mgr = app.exp_mgr();
        let exp = make_exp(&app, 0, 40);
        exp.play();
        exp.play();
        mgr.play(exp.process_id().unwrap());

        assert_eq!(mgr.running_ids().len() + mgr.queued_ids().len(), 1);
        mgr.wait_idle();
        assert_eq!(exp.status(), ExpStatus::Finished);
    }

    #[test]
    fn test_play_unknown_process_is_a_warning() {
        let app = app(1, 0);
        let mgr = app.exp_mgr();
        mgr.play(1234);
        assert!(mgr.running_ids().is_empty());
        assert!(mgr.queued_ids().is_empty());
    }

    #[test]
    fn test_zero_threads_rejects_admissions() {
        let app = app(0, 0);
        let mgr = app.exp_mgr();
        let exp = make_exp(&app, 0, 5);
        exp.play();

        assert!(mgr.running_ids().is_empty());
        assert_eq!(mgr.queued_ids().len(), 1);
        assert_eq!(exp.status(), ExpStatus::Queued);

        mgr.set_threads(1);
        mgr.wait_idle();
        assert_eq!(exp.status(), ExpStatus::Finished);
    }

    #[test]
    fn test_shrink_requeues_tail_at_the_front() {
        let app = app(2, 1);
        let mgr = app.exp_mgr();
        let exps: Vec<_> = (0..4).map(|i| make_exp(&app, i, 100_000)).collect();
        for exp in &exps {
            exp.play();
        }
        assert!(wait_until(|| mgr.running_ids().len() == 2, Duration::from_secs(2)));
        let victim = *mgr.running_ids().last().unwrap();

        mgr.set_threads(1);
        assert!(
            wait_until(
                || mgr.queued_ids().first() == Some(&victim),
                Duration::from_secs(2)
            ),
            "victim must land at the queue front"
        );
        assert!(mgr.running_ids().len() <= 1);

        // Let every run finish quickly.
        for exp in &exps {
            exp.set_stop_at(1);
        }
        mgr.wait_idle();
        for exp in &exps {
            assert_eq!(exp.status(), ExpStatus::Finished);
        }
    }

    #[test]
    fn test_kill_while_running_defers_and_fires_once() {
        let app = app(1, 1);
        let mgr = app.exp_mgr();
        let exp = make_exp(&app, 0, 100_000);
        let pid = exp.process_id().unwrap();

        let kills = Arc::new(AtomicUsize::new(0));
        let k = Arc::clone(&kills);
        mgr.killed.connect(move |_| {
            k.fetch_add(1, Ordering::SeqCst);
        });

        exp.play();
        assert!(wait_until(
            || exp.trial(0).map_or(false, |t| t.step() > 0),
            Duration::from_secs(2)
        ));

        mgr.kill(pid);
        mgr.kill(pid); // still exactly one `killed`
        assert!(wait_until(
            || !mgr.process_ids().contains(&pid),
            Duration::from_secs(2)
        ));
        mgr.wait_idle();
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kill_idle_destroys_immediately() {
        let app = app(1, 0);
        let mgr = app.exp_mgr();
        let exp = make_exp(&app, 0, 5);
        let pid = exp.process_id().unwrap();

        let kills = Arc::new(AtomicUsize::new(0));
        let k = Arc::clone(&kills);
        mgr.killed.connect(move |_| {
            k.fetch_add(1, Ordering::SeqCst);
        });

        mgr.kill(pid);
        assert_eq!(kills.load(Ordering::SeqCst), 1);
        assert!(!mgr.process_ids().contains(&pid));
        assert_eq!(exp.status(), ExpStatus::Invalid);
    }

    #[test]
    fn test_pause_then_play_resumes_without_rewind() {
        let app = app(1, 1);
        let mgr = app.exp_mgr();
        let exp = make_exp(&app, 0, 200);
        exp.play();

        assert!(wait_until(
            || exp.trial(0).map_or(false, |t| t.step() >= 5),
            Duration::from_secs(2)
        ));
        exp.pause();
        mgr.wait_idle();

        let paused_at = exp.trial(0).unwrap().step();
        assert!(paused_at >= 5 && paused_at < 200);
        assert_eq!(exp.status(), ExpStatus::Ready);

        exp.play();
        mgr.wait_idle();
        assert_eq!(exp.status(), ExpStatus::Finished);
        assert_eq!(exp.trial(0).unwrap().step(), 200);
    }

    #[test]
    fn test_mid_run_pause_window() {
        // Three trials, stopAt 100: pausing once progress passes the
        // halfway mark must leave every trial in [50, 100].
        let app = app(1, 1);
        let mgr = app.exp_mgr();
        let project = app.new_project("sched");
        let pairs = [
            ("id", "0"),
            ("trials", "3"),
            ("stopAt", "100"),
            ("nodes", "*4;min"),
            ("graphId", "line"),
            ("modelId", "identity"),
            ("graphType", "undirected"),
        ];
        let header: Vec<String> = pairs.iter().map(|(k, _)| k.to_string()).collect();
        let values: Vec<String> = pairs.iter().map(|(_, v)| v.to_string()).collect();
        let (inputs, _) = ExpInputs::parse(&app, &header, &values).unwrap();
        let exp = project.new_experiment(inputs).unwrap();

        exp.play();
        assert!(wait_until(|| exp.progress() >= 180, Duration::from_secs(2)));
        exp.pause();
        mgr.wait_idle();

        for trial in exp.trials() {
            let step = trial.step();
            assert!((50..=100).contains(&step), "trial at step {}", step);
        }

        exp.play();
        mgr.wait_idle();
        assert_eq!(exp.status(), ExpStatus::Finished);
        for trial in exp.trials() {
            assert_eq!(trial.step(), 100);
        }
    }
}
