// packages/engine/src/runtime/trial.rs
//! Trials
//!
//! A trial is one independent simulation run: its node set, graph and
//! model live in a mutex-held core that only the worker which dispatched
//! the trial ever locks. The step counter and status are atomics so the
//! controller thread can observe progress without touching the core.

use crate::attrs::Value;
use crate::graph::Nodes;
use crate::model::StepOutcome;
use crate::output::Output;
use crate::runtime::experiment::ExpSetup;
use crate::utils::errors::{EngineError, Result};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Lifecycle of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrialStatus {
    /// Created, nodes not yet installed.
    Unset = 0,
    /// Paused mid-run; resumable.
    Ready = 1,
    Running = 2,
    Finished = 3,
    Invalid = 4,
}

impl TrialStatus {
    fn from_u8(raw: u8) -> TrialStatus {
        match raw {
            0 => TrialStatus::Unset,
            1 => TrialStatus::Ready,
            2 => TrialStatus::Running,
            3 => TrialStatus::Finished,
            _ => TrialStatus::Invalid,
        }
    }

    /// Finished or Invalid: the trial will never step again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrialStatus::Finished | TrialStatus::Invalid)
    }
}

/// The worker-confined mutable state of a trial.
pub struct TrialCore {
    pub nodes: Nodes,
    pub graph: Box<dyn crate::graph::Graph>,
    pub model: Box<dyn crate::model::Model>,
    pub output: Option<Arc<Output>>,
}

/// One simulation run within an experiment.
pub struct Trial {
    id: u16,
    step: AtomicU64,
    status: AtomicU8,
    core: Mutex<Option<TrialCore>>,
}

impl Trial {
    pub(crate) fn new(id: u16) -> Trial {
        Trial {
            id,
            step: AtomicU64::new(0),
            status: AtomicU8::new(TrialStatus::Unset as u8),
            core: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Monotonically non-decreasing across observations.
    pub fn step(&self) -> u64 {
        self.step.load(Ordering::Acquire)
    }

    pub fn status(&self) -> TrialStatus {
        TrialStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: TrialStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Snapshot of the node set, for tests and observers. None before
    /// dispatch or after trial deletion.
    pub fn nodes_snapshot(&self) -> Option<Nodes> {
        self.core
            .lock()
            .expect("trial core poisoned")
            .as_ref()
            .map(|core| core.nodes.clone())
    }

    /// Install nodes, graph and model, then transition Unset -> Running.
    /// The step counter stays at 0 and the initial state is flushed as the
    /// step-0 output row. On failure the trial becomes Invalid and its
    /// siblings are unaffected.
    pub(crate) fn dispatch(
        &self,
        setup: &ExpSetup,
        nodes: Nodes,
        output: Option<Arc<Output>>,
    ) -> Result<()> {
        debug_assert_eq!(self.status(), TrialStatus::Unset);

        let install = (|| -> Result<TrialCore> {
            let mut nodes = nodes;
            let mut graph = setup.graph_factory.create();
            graph.init(&nodes, setup.graph_type, &setup.graph_attrs)?;
            let mut model = setup.model_factory.create();
            model.init(&mut nodes, &*graph, &setup.model_attrs)?;
            Ok(TrialCore {
                nodes,
                graph,
                model,
                output,
            })
        })();

        match install {
            Ok(core) => {
                let mut guard = self.core.lock().expect("trial core poisoned");
                *guard = Some(core);
                self.set_status(TrialStatus::Running);
                debug!(trial = self.id, "trial dispatched");
                drop(guard);
                self.flush_outputs()
            }
            Err(e) => {
                self.set_status(TrialStatus::Invalid);
                warn!(trial = self.id, error = %e, "trial dispatch failed");
                Err(e)
            }
        }
    }

    /// Advance until the step counter reaches `target`, the model
    /// terminates, or the trial leaves Running. Output emission is the
    /// last action of every step.
    pub(crate) fn run_until(&self, target: u64) -> Result<()> {
        let mut guard = self.core.lock().expect("trial core poisoned");
        let core = guard
            .as_mut()
            .ok_or_else(|| EngineError::Runtime(format!("trial {} has no core", self.id)))?;

        while self.step() < target && self.status() == TrialStatus::Running {
            match core.model.step(&mut core.nodes, &*core.graph) {
                Ok(outcome) => {
                    let step = self.step.fetch_add(1, Ordering::AcqRel) + 1;
                    if let Some(output) = core.output.as_ref() {
                        write_row(output, step, core)?;
                    }
                    if outcome == StepOutcome::Terminate {
                        self.set_status(TrialStatus::Finished);
                        debug!(trial = self.id, step, "model terminated");
                    }
                }
                Err(e) => {
                    self.set_status(TrialStatus::Invalid);
                    warn!(trial = self.id, error = %e, "model step failed");
                    return Err(EngineError::Runtime(format!(
                        "trial {} failed at step {}: {}",
                        self.id,
                        self.step(),
                        e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Emit the current step's columns to this trial's sink.
    pub(crate) fn flush_outputs(&self) -> Result<()> {
        let mut guard = self.core.lock().expect("trial core poisoned");
        if let Some(core) = guard.as_mut() {
            if let Some(output) = core.output.as_ref() {
                write_row(output, self.step(), core)?;
            }
        }
        Ok(())
    }

    /// Flush the sink's buffered rows down to the file.
    pub(crate) fn sync_outputs(&self) -> Result<()> {
        let guard = self.core.lock().expect("trial core poisoned");
        match guard.as_ref().and_then(|core| core.output.as_ref()) {
            Some(output) => output.flush(),
            None => Ok(()),
        }
    }
}

fn write_row(output: &Output, step: u64, core: &TrialCore) -> Result<()> {
    let row: Vec<Value> = output
        .header()
        .iter()
        .map(|column| {
            if column == "step" {
                Value::ULong(step)
            } else {
                core.model
                    .custom_output(column, &core.nodes)
                    .unwrap_or_else(|| Value::Text(String::new()))
            }
        })
        .collect();
    output.push_row(&row)
}
