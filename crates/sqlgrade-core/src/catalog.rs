use crate::config::problem::load_problem;
use crate::model::ProblemSpec;
use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Read access to authored problems.
pub trait ProblemCatalog: Send + Sync {
    fn get(&self, problem_id: &str) -> anyhow::Result<Option<Arc<ProblemSpec>>>;
}

/// One `<id>.yaml` file per problem. Specs are parsed on first use and kept.
pub struct DirectoryCatalog {
    root: PathBuf,
    loaded: RwLock<HashMap<String, Arc<ProblemSpec>>>,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loaded: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, problem_id: &str) -> Option<PathBuf> {
        let valid = !problem_id.is_empty()
            && problem_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return None;
        }
        ["yaml", "yml"]
            .iter()
            .map(|ext| self.root.join(format!("{problem_id}.{ext}")))
            .find(|p| p.exists())
    }
}

impl ProblemCatalog for DirectoryCatalog {
    fn get(&self, problem_id: &str) -> anyhow::Result<Option<Arc<ProblemSpec>>> {
        if let Some(spec) = self.loaded.read().unwrap().get(problem_id) {
            return Ok(Some(spec.clone()));
        }

        let Some(path) = self.path_for(problem_id) else {
            return Ok(None);
        };
        let spec = load_problem(&path, true)
            .with_context(|| format!("failed to load problem '{problem_id}'"))?;
        if spec.id != problem_id {
            anyhow::bail!(
                "problem file {} declares id '{}', expected '{}'",
                path.display(),
                spec.id,
                problem_id
            );
        }

        let spec = Arc::new(spec);
        self.loaded
            .write()
            .unwrap()
            .insert(problem_id.to_string(), spec.clone());
        Ok(Some(spec))
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    problems: RwLock<HashMap<String, Arc<ProblemSpec>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, spec: ProblemSpec) {
        self.problems
            .write()
            .unwrap()
            .insert(spec.id.clone(), Arc::new(spec));
    }
}

impl ProblemCatalog for MemoryCatalog {
    fn get(&self, problem_id: &str) -> anyhow::Result<Option<Arc<ProblemSpec>>> {
        Ok(self.problems.read().unwrap().get(problem_id).cloned())
    }
}
