// packages/engine/src/app.rs
//! Main controller
//!
//! The `App` is the global entry point: it owns the experiments manager,
//! the model/graph plugin registries, the default inter-step delay and the
//! open projects. It is purely compositional; all concurrency lives in the
//! manager. Plugins are registered by id at startup; how they are loaded
//! is not the engine's concern.

use crate::attrs::AttrScope;
use crate::graph::plugins::{CycleGraphFactory, LineGraphFactory, RandomGraphFactory};
use crate::graph::GraphFactory;
use crate::inputs;
use crate::model::plugins::{AgingModelFactory, IdentityModelFactory};
use crate::model::ModelFactory;
use crate::project::Project;
use crate::runtime::exp_mgr::ExperimentsMgr;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info};

/// Global engine state: manager, registries, projects.
pub struct App {
    weak_self: Weak<App>,
    exp_mgr: Arc<ExperimentsMgr>,
    models: RwLock<HashMap<String, Arc<dyn ModelFactory>>>,
    graphs: RwLock<HashMap<String, Arc<dyn GraphFactory>>>,
    general_scope: AttrScope,
    default_step_delay_ms: AtomicU64,
    projects: Mutex<BTreeMap<u16, Arc<Project>>>,
}

impl App {
    pub fn new(config: &EngineConfig) -> Arc<App> {
        let app = Arc::new_cyclic(|weak| App {
            weak_self: weak.clone(),
            exp_mgr: ExperimentsMgr::new(config.threads),
            models: RwLock::new(HashMap::new()),
            graphs: RwLock::new(HashMap::new()),
            general_scope: inputs::general_attrs_scope(),
            default_step_delay_ms: AtomicU64::new(config.step_delay_ms),
            projects: Mutex::new(BTreeMap::new()),
        });
        info!(
            threads = config.threads,
            step_delay_ms = config.step_delay_ms,
            "app initialized"
        );
        app
    }

    /// `new` plus the built-in plugins (line/cycle/random graphs,
    /// identity/aging models).
    pub fn with_builtin_plugins(config: &EngineConfig) -> Arc<App> {
        let app = Self::new(config);
        app.register_graph(Arc::new(LineGraphFactory))
            .and_then(|_| app.register_graph(Arc::new(CycleGraphFactory)))
            .and_then(|_| app.register_graph(Arc::new(RandomGraphFactory)))
            .and_then(|_| app.register_model(Arc::new(IdentityModelFactory)))
            .and_then(|_| app.register_model(Arc::new(AgingModelFactory)))
            .expect("built-in plugin ids cannot collide");
        app
    }

    pub fn register_model(&self, factory: Arc<dyn ModelFactory>) -> Result<()> {
        let id = factory.id().to_string();
        let mut models = self.models.write().expect("model registry poisoned");
        if models.contains_key(&id) {
            return Err(EngineError::Config(format!(
                "a model plugin with id '{}' is already registered",
                id
            )));
        }
        debug!(id = %id, "model plugin registered");
        models.insert(id, factory);
        Ok(())
    }

    pub fn register_graph(&self, factory: Arc<dyn GraphFactory>) -> Result<()> {
        let id = factory.id().to_string();
        let mut graphs = self.graphs.write().expect("graph registry poisoned");
        if graphs.contains_key(&id) {
            return Err(EngineError::Config(format!(
                "a graph plugin with id '{}' is already registered",
                id
            )));
        }
        debug!(id = %id, "graph plugin registered");
        graphs.insert(id, factory);
        Ok(())
    }

    pub fn model(&self, id: &str) -> Option<Arc<dyn ModelFactory>> {
        self.models
            .read()
            .expect("model registry poisoned")
            .get(id)
            .cloned()
    }

    pub fn graph(&self, id: &str) -> Option<Arc<dyn GraphFactory>> {
        self.graphs
            .read()
            .expect("graph registry poisoned")
            .get(id)
            .cloned()
    }

    pub fn general_attrs_scope(&self) -> AttrScope {
        self.general_scope.clone()
    }

    pub fn exp_mgr(&self) -> &Arc<ExperimentsMgr> {
        &self.exp_mgr
    }

    pub fn default_step_delay_ms(&self) -> u64 {
        self.default_step_delay_ms.load(Ordering::Acquire)
    }

    pub fn set_default_step_delay_ms(&self, delay: u64) {
        self.default_step_delay_ms.store(delay, Ordering::Release);
    }

    /// Open a new empty project.
    pub fn new_project(&self, name: &str) -> Arc<Project> {
        let this = self.weak_self.upgrade().expect("self is alive");
        let mut projects = self.projects.lock().expect("projects poisoned");
        let id = projects.last_key_value().map_or(0, |(id, _)| id + 1);
        let project = Project::new(&this, id, name);
        projects.insert(id, Arc::clone(&project));
        project
    }

    /// Close a project. Dropping the last handle releases its
    /// experiments; busy ones are killed through the manager.
    pub fn close_project(&self, id: u16) -> Option<Arc<Project>> {
        self.projects.lock().expect("projects poisoned").remove(&id)
    }

    pub fn project(&self, id: u16) -> Option<Arc<Project>> {
        self.projects
            .lock()
            .expect("projects poisoned")
            .get(&id)
            .cloned()
    }

    pub fn projects(&self) -> Vec<Arc<Project>> {
        self.projects
            .lock()
            .expect("projects poisoned")
            .values()
            .cloned()
            .collect()
    }
}
