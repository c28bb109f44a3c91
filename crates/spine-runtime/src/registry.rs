//! Explicit pipeline registry
//!
//! Pipelines are registered at startup from a known module; nothing is
//! registered by import side-effects.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::pipeline::{Pipeline, PipelineSpec};

/// Registry of executable pipelines
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<String, Arc<dyn Pipeline>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline. Re-registering a name replaces the previous
    /// entry (useful for tests).
    pub fn register(&self, pipeline: Arc<dyn Pipeline>) {
        let name = pipeline.name().to_string();
        self.pipelines.write().insert(name, pipeline);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Pipeline>> {
        self.pipelines.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.read().contains_key(name)
    }

    /// Specs of registered pipelines, optionally prefix-filtered, sorted by name
    pub fn list(&self, prefix: Option<&str>) -> Vec<PipelineSpec> {
        let mut specs: Vec<PipelineSpec> = self
            .pipelines
            .read()
            .values()
            .filter(|p| prefix.map(|pre| p.name().starts_with(pre)).unwrap_or(true))
            .map(|p| p.describe())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.pipelines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineContext, PipelineResult};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeMap;

    struct FakePipeline(&'static str);

    #[async_trait]
    impl Pipeline for FakePipeline {
        fn name(&self) -> &str {
            self.0
        }

        fn describe(&self) -> PipelineSpec {
            PipelineSpec::new(self.0)
        }

        async fn run(
            &self,
            _params: &BTreeMap<String, Value>,
            _ctx: &PipelineContext,
        ) -> spine_core::Result<PipelineResult> {
            Ok(PipelineResult::new())
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = PipelineRegistry::new();
        registry.register(Arc::new(FakePipeline("finra.ingest")));
        assert!(registry.get("finra.ingest").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_list_prefix_filter() {
        let registry = PipelineRegistry::new();
        registry.register(Arc::new(FakePipeline("finra.ingest")));
        registry.register(Arc::new(FakePipeline("finra.compute")));
        registry.register(Arc::new(FakePipeline("prices.fetch")));

        assert_eq!(registry.list(None).len(), 3);
        assert_eq!(registry.list(Some("finra.")).len(), 2);
        assert_eq!(registry.list(Some("prices.")).len(), 1);

        // Sorted by name
        let names: Vec<String> = registry.list(None).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["finra.compute", "finra.ingest", "prices.fetch"]);
    }
}
