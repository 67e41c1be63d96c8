// packages/engine/src/project.rs
//! Projects
//!
//! A project is a keyed collection of experiments with unique-id
//! generation, bulk play/pause, a dirty flag toggled by any add/remove/
//! edit, and import/save in the delimited experiments-file format (comma
//! separators, one header row, one experiment per row).

use crate::app::App;
use crate::inputs::{ExpInputs, ATTR_EXPID};
use crate::runtime::experiment::Experiment;
use crate::utils::errors::{EngineError, Result};
use crate::utils::signals::Signal;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

/// A named collection of experiments.
pub struct Project {
    id: u16,
    name: String,
    app: Weak<App>,
    weak_self: Weak<Project>,
    experiments: Mutex<BTreeMap<i32, Arc<Experiment>>>,
    dirty: AtomicBool,

    pub exp_added: Signal<i32>,
    pub exp_removed: Signal<i32>,
    pub exp_edited: Signal<i32>,
    pub unsaved_changes: Signal<bool>,
}

impl Project {
    pub(crate) fn new(app: &Arc<App>, id: u16, name: &str) -> Arc<Project> {
        Arc::new_cyclic(|weak| Project {
            id,
            name: name.to_string(),
            app: Arc::downgrade(app),
            weak_self: weak.clone(),
            experiments: Mutex::new(BTreeMap::new()),
            dirty: AtomicBool::new(false),
            exp_added: Signal::new(),
            exp_removed: Signal::new(),
            exp_edited: Signal::new(),
            unsaved_changes: Signal::new(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.clone()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.unsaved_changes.emit(&true);
    }

    /// Next experiment id: one past the current maximum.
    pub fn generate_exp_id(&self) -> i32 {
        let experiments = self.experiments.lock().expect("experiments poisoned");
        experiments.last_key_value().map_or(0, |(id, _)| id + 1)
    }

    pub fn experiment(&self, exp_id: i32) -> Option<Arc<Experiment>> {
        let experiments = self.experiments.lock().expect("experiments poisoned");
        experiments.get(&exp_id).cloned()
    }

    pub fn experiments(&self) -> Vec<Arc<Experiment>> {
        let experiments = self.experiments.lock().expect("experiments poisoned");
        experiments.values().cloned().collect()
    }

    /// Create an experiment from validated inputs and register it with the
    /// manager. The returned experiment is live even when its init failed:
    /// it reports status Invalid and carries the error message.
    pub fn new_experiment(&self, inputs: ExpInputs) -> Result<Arc<Experiment>> {
        let exp_id = inputs
            .exp_id()
            .ok_or_else(|| EngineError::Config("experiment id is missing".to_string()))?;
        let app = self
            .app
            .upgrade()
            .ok_or_else(|| EngineError::Config("the application is gone".to_string()))?;
        let this = self
            .weak_self
            .upgrade()
            .ok_or_else(|| EngineError::Config("the project is gone".to_string()))?;

        let exp = {
            let mut experiments = self.experiments.lock().expect("experiments poisoned");
            if experiments.contains_key(&exp_id) {
                return Err(EngineError::Config(format!(
                    "the experiment id must be unique; {} exists",
                    exp_id
                )));
            }
            let exp = Experiment::new(&app, &this, inputs);
            experiments.insert(exp_id, Arc::clone(&exp));
            exp
        };

        app.exp_mgr().add(&exp);
        if let Err(e) = exp.init() {
            warn!(project = self.id, exp = exp_id, error = %e, "experiment created invalid");
        }

        self.mark_dirty();
        self.exp_added.emit(&exp_id);
        Ok(exp)
    }

    /// Remove an idle experiment; Queued/Running must be paused first.
    pub fn remove_experiment(&self, exp_id: i32) -> Result<()> {
        let exp = {
            let mut experiments = self.experiments.lock().expect("experiments poisoned");
            let exp = experiments
                .get(&exp_id)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Scheduling("tried to remove a nonexistent experiment".to_string())
                })?;
            if exp.status().is_busy() {
                return Err(EngineError::Scheduling(
                    "tried to remove a running experiment; pause it first".to_string(),
                ));
            }
            experiments.remove(&exp_id);
            exp
        };

        if let (Some(app), Some(pid)) = (self.app.upgrade(), exp.process_id()) {
            app.exp_mgr().kill(pid);
        }
        info!(project = self.id, exp = exp_id, "experiment removed");
        self.mark_dirty();
        self.exp_removed.emit(&exp_id);
        Ok(())
    }

    /// Replace an idle experiment's inputs and re-initialize it.
    pub fn edit_experiment(&self, exp_id: i32, inputs: ExpInputs) -> Result<()> {
        let exp = self.experiment(exp_id).ok_or_else(|| {
            EngineError::Scheduling("tried to edit a nonexistent experiment".to_string())
        })?;
        exp.set_inputs(inputs)?;
        self.mark_dirty();
        self.exp_edited.emit(&exp_id);
        Ok(())
    }

    pub fn play_all(&self) {
        for exp in self.experiments() {
            exp.play();
        }
    }

    pub fn pause_all(&self) {
        for exp in self.experiments() {
            if exp.status().is_busy() {
                exp.pause();
            }
        }
    }

    /// Import experiments from a delimited file. Per-row failures are
    /// non-fatal: the row is skipped and reported in the returned warning
    /// list. Returns the number of experiments imported.
    pub fn import_experiments(&self, path: &Path) -> Result<(usize, Vec<String>)> {
        let app = self
            .app
            .upgrade()
            .ok_or_else(|| EngineError::Config("the application is gone".to_string()))?;
        let raw = std::fs::read_to_string(path)?;
        let mut lines = raw.lines();
        let header: Vec<String> = lines
            .next()
            .map(|line| line.split(',').map(str::trim).map(str::to_string).collect())
            .unwrap_or_default();
        if header.is_empty() || header.iter().all(String::is_empty) {
            return Err(EngineError::Config(format!(
                "no experiments to read from '{}': the header row is empty",
                path.display()
            )));
        }

        let mut imported = 0;
        let mut warnings = Vec::new();
        for (row, line) in lines.enumerate() {
            let row = row + 1;
            if line.trim().is_empty() {
                continue;
            }
            let values: Vec<String> = line.split(',').map(str::trim).map(str::to_string).collect();
            match ExpInputs::parse(&app, &header, &values) {
                Ok((inputs, row_warnings)) => {
                    for w in row_warnings {
                        warnings.push(format!("row {}: {}", row, w));
                    }
                    match self.new_experiment(inputs) {
                        Ok(_) => imported += 1,
                        Err(e) => warnings.push(format!("row {} skipped: {}", row, e)),
                    }
                }
                Err(e) => warnings.push(format!("row {} skipped: {}", row, e)),
            }
        }

        debug!(project = self.id, imported, "experiments imported");
        Ok((imported, warnings))
    }

    /// Save every experiment to the delimited format. The header is the
    /// sorted union of attribute names across experiments, with the
    /// experiment id forced to the first column.
    pub fn save(&self, path: &Path) -> Result<()> {
        let experiments = self.experiments();
        if experiments.is_empty() {
            return Err(EngineError::Config(format!(
                "project '{}' is empty; there is nothing to save",
                self.name
            )));
        }

        let mut columns: BTreeSet<String> = BTreeSet::new();
        let inputs: Vec<ExpInputs> = experiments.iter().map(|e| e.inputs()).collect();
        for exp_inputs in &inputs {
            columns.extend(exp_inputs.export_attr_names());
        }
        columns.remove(ATTR_EXPID);
        let mut header: Vec<String> = vec![ATTR_EXPID.to_string()];
        header.extend(columns);

        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        writeln!(file, "{}", header.join(","))?;
        for exp_inputs in &inputs {
            let row: Vec<String> = header
                .iter()
                .map(|column| {
                    exp_inputs
                        .export_value(column)
                        .map_or_else(String::new, |v| v.to_string())
                })
                .collect();
            writeln!(file, "{}", row.join(","))?;
        }
        file.flush()?;

        self.dirty.store(false, Ordering::Release);
        self.unsaved_changes.emit(&false);
        info!(project = self.id, path = %path.display(), "project saved");
        Ok(())
    }
}

impl Drop for Project {
    fn drop(&mut self) {
        // Destruction must respect busy experiments: route every teardown
        // through the manager's kill protocol (deferred for Running ids,
        // immediate otherwise), exactly like remove_experiment. Falling
        // back to a direct invalidate is only for experiments that never
        // got registered.
        let experiments: Vec<Arc<Experiment>> = {
            let mut experiments = self.experiments.lock().expect("experiments poisoned");
            std::mem::take(&mut *experiments).into_values().collect()
        };
        let app = self.app.upgrade();
        for exp in experiments {
            match (app.as_ref(), exp.process_id()) {
                (Some(app), Some(pid)) => app.exp_mgr().kill(pid),
                _ => exp.invalidate(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::experiment::ExpStatus;
    use crate::utils::config::EngineConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn app(threads: usize) -> Arc<App> {
        App::with_builtin_plugins(&EngineConfig {
            threads,
            step_delay_ms: 0,
        })
    }

    fn parse_inputs(app: &Arc<App>, pairs: &[(&str, String)]) -> ExpInputs {
        let header: Vec<String> = pairs.iter().map(|(k, _)| k.to_string()).collect();
        let values: Vec<String> = pairs.iter().map(|(_, v)| v.clone()).collect();
        ExpInputs::parse(app, &header, &values).unwrap().0
    }

    fn identity_pairs(exp_id: i32) -> Vec<(&'static str, String)> {
        vec![
            ("id", exp_id.to_string()),
            ("trials", "1".to_string()),
            ("stopAt", "5".to_string()),
            ("nodes", "*3;min".to_string()),
            ("graphId", "line".to_string()),
            ("modelId", "identity".to_string()),
            ("graphType", "undirected".to_string()),
        ]
    }

    #[test]
    fn test_generate_exp_id_is_monotonic() {
        let app = app(1);
        let project = app.new_project("p");
        assert_eq!(project.generate_exp_id(), 0);
        project
            .new_experiment(parse_inputs(&app, &identity_pairs(0)))
            .unwrap();
        project
            .new_experiment(parse_inputs(&app, &identity_pairs(4)))
            .unwrap();
        assert_eq!(project.generate_exp_id(), 5);
    }

    #[test]
    fn test_duplicate_experiment_id_is_rejected() {
        let app = app(1);
        let project = app.new_project("p");
        project
            .new_experiment(parse_inputs(&app, &identity_pairs(1)))
            .unwrap();
        assert!(project
            .new_experiment(parse_inputs(&app, &identity_pairs(1)))
            .is_err());
    }

    #[test]
    fn test_add_sets_dirty_and_emits() {
        let app = app(1);
        let project = app.new_project("p");
        let added = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&added);
        project.exp_added.connect(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!project.has_unsaved_changes());
        project
            .new_experiment(parse_inputs(&app, &identity_pairs(0)))
            .unwrap();
        assert!(project.has_unsaved_changes());
        assert_eq!(added.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_experiment_still_sets_dirty() {
        let app = app(1);
        let project = app.new_project("p");
        let mut pairs = identity_pairs(0);
        for pair in pairs.iter_mut() {
            if pair.0 == "modelId" {
                pair.1 = "marl".to_string();
            }
        }
        let exp = project.new_experiment(parse_inputs(&app, &pairs)).unwrap();
        assert_eq!(exp.status(), ExpStatus::Invalid);
        assert!(!exp.error().is_empty());
        assert!(project.has_unsaved_changes());
    }

    #[test]
    fn test_remove_rejected_while_queued() {
        let app = app(0); // nothing is admitted; play leaves it Queued
        let project = app.new_project("p");
        let exp = project
            .new_experiment(parse_inputs(&app, &identity_pairs(0)))
            .unwrap();
        exp.play();
        assert_eq!(exp.status(), ExpStatus::Queued);
        assert!(project.remove_experiment(0).is_err());

        exp.pause(); // dequeues
        assert_eq!(exp.status(), ExpStatus::Ready);
        project.remove_experiment(0).unwrap();
        assert!(project.experiment(0).is_none());
    }

    #[test]
    fn test_edit_requires_idle_and_sets_dirty() {
        let app = app(0);
        let project = app.new_project("p");
        let exp = project
            .new_experiment(parse_inputs(&app, &identity_pairs(0)))
            .unwrap();

        exp.play();
        assert!(project
            .edit_experiment(0, parse_inputs(&app, &identity_pairs(0)))
            .is_err());
        exp.pause();

        let mut pairs = identity_pairs(0);
        for pair in pairs.iter_mut() {
            if pair.0 == "stopAt" {
                pair.1 = "9".to_string();
            }
        }
        project
            .edit_experiment(0, parse_inputs(&app, &pairs))
            .unwrap();
        assert_eq!(exp.inputs().stop_at(), Some(9));
    }

    #[test]
    fn test_save_then_import_round_trips_inputs() {
        let app1 = app(1);
        let project = app1.new_project("p");
        project
            .new_experiment(parse_inputs(&app1, &identity_pairs(0)))
            .unwrap();
        let mut aging = identity_pairs(1);
        for pair in aging.iter_mut() {
            if pair.0 == "modelId" {
                pair.1 = "aging".to_string();
            }
        }
        aging.push(("aging_maxAge", "12".to_string()));
        project.new_experiment(parse_inputs(&app1, &aging)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.csv");
        project.save(&path).unwrap();
        assert!(!project.has_unsaved_changes());

        // The id must be the first header column.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.lines().next().unwrap().starts_with("id,"));

        let app2 = app(1);
        let restored = app2.new_project("p");
        let (imported, warnings) = restored.import_experiments(&path).unwrap();
        assert_eq!(imported, 2);
        assert!(warnings.is_empty(), "warnings: {:?}", warnings);

        for exp in project.experiments() {
            let original = exp.inputs();
            let loaded = restored.experiment(exp.id()).unwrap().inputs();
            for column in original.export_attr_names() {
                assert_eq!(
                    original.export_value(&column),
                    loaded.export_value(&column),
                    "column {}",
                    column
                );
            }
        }
    }

    #[test]
    fn test_import_skips_bad_rows_non_fatally() {
        let app = app(1);
        let project = app.new_project("p");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exps.csv");
        std::fs::write(
            &path,
            "id,trials,stopAt,nodes,graphId,modelId,graphType\n\
             0,1,5,*3;min,line,identity,undirected\n\
             1,0,5,*3;min,line,identity,undirected\n\
             2,1,5,*3;min,line,identity,undirected\n",
        )
        .unwrap();

        let (imported, warnings) = project.import_experiments(&path).unwrap();
        assert_eq!(imported, 2);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("row 2"));
    }

    #[test]
    fn test_save_empty_project_is_an_error() {
        let app = app(1);
        let project = app.new_project("p");
        let dir = tempfile::tempdir().unwrap();
        assert!(project.save(&dir.path().join("p.csv")).is_err());
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
    fn test_drop_kills_queued_experiments_via_manager() {
        let app = app(0); // nothing is admitted; play leaves it Queued
        let mgr = Arc::clone(app.exp_mgr());
        let project = app.new_project("p");
        let exp = project
            .new_experiment(parse_inputs(&app, &identity_pairs(0)))
            .unwrap();
        exp.play();
        let pid = exp.process_id().unwrap();
        assert_eq!(exp.status(), ExpStatus::Queued);

        let kills = Arc::new(AtomicUsize::new(0));
        let k = Arc::clone(&kills);
        mgr.killed.connect(move |_| {
            k.fetch_add(1, Ordering::SeqCst);
        });

        drop(project);
        assert!(app.close_project(0).is_some());

        assert_eq!(kills.load(Ordering::SeqCst), 1);
        assert!(!mgr.process_ids().contains(&pid));
        assert!(mgr.queued_ids().is_empty());
        assert_eq!(exp.status(), ExpStatus::Invalid);
    }

    #[test]
    fn test_drop_defers_kill_of_running_experiments() {
        let app = App::with_builtin_plugins(&EngineConfig {
            threads: 1,
            step_delay_ms: 1,
        });
        let mgr = Arc::clone(app.exp_mgr());
        let project = app.new_project("p");
        let mut pairs = identity_pairs(0);
        for pair in pairs.iter_mut() {
            if pair.0 == "stopAt" {
                pair.1 = "100000".to_string();
            }
        }
        let exp = project.new_experiment(parse_inputs(&app, &pairs)).unwrap();

        let kills = Arc::new(AtomicUsize::new(0));
        let k = Arc::clone(&kills);
        mgr.killed.connect(move |_| {
            k.fetch_add(1, Ordering::SeqCst);
        });

        exp.play();
        let pid = exp.process_id().unwrap();
        assert!(wait_until(
            || exp.trial(0).map_or(false, |t| t.step() > 0),
            Duration::from_secs(2)
        ));

        drop(project);
        assert!(app.close_project(0).is_some());

        // The worker observes the kill flag at the next step boundary and
        // the completion handler destroys the process.
        assert!(wait_until(
            || !mgr.process_ids().contains(&pid),
            Duration::from_secs(2)
        ));
        mgr.wait_idle();
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bulk_play_and_pause() {
        let app = app(0);
        let project = app.new_project("p");
        for exp_id in 0..3 {
            project
                .new_experiment(parse_inputs(&app, &identity_pairs(exp_id)))
                .unwrap();
        }
        project.play_all();
        for exp in project.experiments() {
            assert_eq!(exp.status(), ExpStatus::Queued);
        }
        project.pause_all();
        for exp in project.experiments() {
            assert_eq!(exp.status(), ExpStatus::Ready);
        }
    }
}
