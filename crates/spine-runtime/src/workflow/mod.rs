//! Workflow definitions: an ordered DAG of steps
//!
//! Steps declare dependencies by name; cycles are rejected at registration.
//! Three step kinds: `pipeline` (submits through the Dispatcher), `lambda`
//! (validation/glue only) and `choice` (branches by predicate). Steps gated
//! on a choice are recorded as skipped, along with their descendants.

mod context;
mod runner;

pub use context::WorkflowContext;
pub use runner::WorkflowRunner;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;

use spine_core::{Result, SpineError};

use crate::retry::RetryPolicy;

/// Async glue function: `(context, config) → output`
pub type LambdaFn =
    dyn Fn(WorkflowContext, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// Branch predicate over the accumulated context
pub type PredicateFn = dyn Fn(&WorkflowContext) -> bool + Send + Sync;

/// What a step does
#[derive(Clone)]
pub enum StepKind {
    /// Submit a registered pipeline; its result becomes the step output
    Pipeline {
        pipeline: String,
        params: serde_json::Map<String, Value>,
    },
    /// Invoke a user-supplied function. For validation/glue only — not for
    /// doing the work a pipeline should do.
    Lambda {
        config: Value,
        func: Arc<LambdaFn>,
    },
    /// Evaluate a predicate; output is `{"value": bool}`
    Choice { predicate: Arc<PredicateFn> },
}

impl StepKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            StepKind::Pipeline { .. } => "pipeline",
            StepKind::Lambda { .. } => "lambda",
            StepKind::Choice { .. } => "choice",
        }
    }
}

impl std::fmt::Debug for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind_name())
    }
}

/// Gate a step on the boolean output of an upstream choice step
#[derive(Debug, Clone)]
pub struct StepCondition {
    pub choice: String,
    pub equals: bool,
}

/// One step of a workflow
#[derive(Clone)]
pub struct StepSpec {
    pub name: String,
    pub kind: StepKind,
    pub depends_on: Vec<String>,
    pub retry: RetryPolicy,
    pub when: Option<StepCondition>,
}

impl StepSpec {
    pub fn pipeline(name: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Pipeline {
                pipeline: pipeline.into(),
                params: serde_json::Map::new(),
            },
            depends_on: vec![],
            retry: RetryPolicy::no_retry(),
            when: None,
        }
    }

    pub fn lambda<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind::Lambda {
                config: Value::Object(Default::default()),
                func: Arc::new(move |ctx, cfg| Box::pin(func(ctx, cfg))),
            },
            depends_on: vec![],
            retry: RetryPolicy::no_retry(),
            when: None,
        }
    }

    pub fn choice<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind::Choice {
                predicate: Arc::new(predicate),
            },
            depends_on: vec![],
            retry: RetryPolicy::no_retry(),
            when: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let StepKind::Pipeline { params, .. } = &mut self.kind {
            params.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        if let StepKind::Lambda { config: c, .. } = &mut self.kind {
            *c = config;
        }
        self
    }

    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn when(mut self, choice: impl Into<String>, equals: bool) -> Self {
        self.when = Some(StepCondition {
            choice: choice.into(),
            equals,
        });
        self
    }
}

/// A named DAG of steps
#[derive(Clone)]
pub struct WorkflowSpec {
    pub name: String,
    pub description: String,
    pub steps: Vec<StepSpec>,
    /// Parallelism within a topological layer (1 = sequential)
    pub concurrency: usize,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps: vec![],
            concurrency: 1,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Kahn layering over `depends_on`. Errors on duplicate names, unknown
    /// dependencies, bad conditions and cycles.
    pub fn topo_layers(&self) -> Result<Vec<Vec<usize>>> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            if index.insert(step.name.as_str(), i).is_some() {
                return Err(SpineError::config(format!(
                    "workflow '{}': duplicate step name '{}'",
                    self.name, step.name
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !index.contains_key(dep.as_str()) {
                    return Err(SpineError::config(format!(
                        "workflow '{}': step '{}' depends on unknown step '{}'",
                        self.name, step.name, dep
                    )));
                }
            }
            if let Some(condition) = &step.when {
                match index.get(condition.choice.as_str()) {
                    Some(&i) if matches!(self.steps[i].kind, StepKind::Choice { .. }) => {}
                    _ => {
                        return Err(SpineError::config(format!(
                            "workflow '{}': step '{}' gated on '{}' which is not a choice step",
                            self.name, step.name, condition.choice
                        )))
                    }
                }
            }
        }

        let mut in_degree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![vec![]; self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let d = index[dep.as_str()];
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut layers = Vec::new();
        let mut current: Vec<usize> = (0..self.steps.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut seen = 0;

        while !current.is_empty() {
            seen += current.len();
            let mut next = Vec::new();
            for &i in &current {
                for &j in &dependents[i] {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        next.push(j);
                    }
                }
            }
            layers.push(std::mem::take(&mut current));
            current = next;
        }

        if seen != self.steps.len() {
            let stuck: Vec<&str> = (0..self.steps.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.steps[i].name.as_str())
                .collect();
            return Err(SpineError::config(format!(
                "workflow '{}': dependency cycle involving {stuck:?}",
                self.name
            )));
        }

        Ok(layers)
    }

    /// Names of every step transitively downstream of `root`
    pub fn descendants(&self, root: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut stack = vec![root.to_string()];
        while let Some(name) = stack.pop() {
            for step in &self.steps {
                if step.depends_on.contains(&name) && result.insert(step.name.clone()) {
                    stack.push(step.name.clone());
                }
            }
        }
        result
    }
}

/// Registry of runnable workflows; registration validates the DAG
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<WorkflowSpec>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow. Cycles and bad references are rejected here,
    /// not at run time.
    pub fn register(&self, spec: WorkflowSpec) -> Result<()> {
        spec.topo_layers()?;
        self.workflows
            .write()
            .insert(spec.name.clone(), Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowSpec>> {
        self.workflows.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lambda(name: &str) -> StepSpec {
        StepSpec::lambda(name, |_ctx, _cfg| async { Ok(Value::Null) })
    }

    #[test]
    fn test_topo_layers_linear() {
        let spec = WorkflowSpec::new("w")
            .step(lambda("a"))
            .step(lambda("b").after("a"))
            .step(lambda("c").after("b"));

        let layers = spec.topo_layers().unwrap();
        assert_eq!(layers, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_topo_layers_diamond() {
        let spec = WorkflowSpec::new("w")
            .step(lambda("a"))
            .step(lambda("b").after("a"))
            .step(lambda("c").after("a"))
            .step(lambda("d").after("b").after("c"));

        let layers = spec.topo_layers().unwrap();
        assert_eq!(layers[0], vec![0]);
        assert_eq!(layers[1], vec![1, 2]);
        assert_eq!(layers[2], vec![3]);
    }

    #[test]
    fn test_cycle_rejected() {
        let spec = WorkflowSpec::new("w")
            .step(lambda("a").after("b"))
            .step(lambda("b").after("a"));

        let err = spec.topo_layers().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let spec = WorkflowSpec::new("w").step(lambda("a").after("ghost"));
        assert!(spec.topo_layers().is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let spec = WorkflowSpec::new("w").step(lambda("a")).step(lambda("a"));
        assert!(spec.topo_layers().is_err());
    }

    #[test]
    fn test_when_must_reference_choice() {
        let spec = WorkflowSpec::new("w")
            .step(lambda("a"))
            .step(lambda("b").after("a").when("a", true));
        assert!(spec.topo_layers().is_err());

        let spec = WorkflowSpec::new("w")
            .step(StepSpec::choice("gate", |_| true))
            .step(lambda("b").after("gate").when("gate", true));
        assert!(spec.topo_layers().is_ok());
    }

    #[test]
    fn test_descendants() {
        let spec = WorkflowSpec::new("w")
            .step(lambda("a"))
            .step(lambda("b").after("a"))
            .step(lambda("c").after("b"))
            .step(lambda("d"));

        let down = spec.descendants("a");
        assert!(down.contains("b"));
        assert!(down.contains("c"));
        assert!(!down.contains("d"));
    }

    #[test]
    fn test_registry_rejects_cyclic_registration() {
        let registry = WorkflowRegistry::new();
        let bad = WorkflowSpec::new("bad")
            .step(lambda("a").after("b"))
            .step(lambda("b").after("a"));
        assert!(registry.register(bad).is_err());
        assert!(registry.get("bad").is_none());
    }
}
