// Pipeline registration
//
// The core ships no concrete pipelines; deployments link their pipeline
// crates and register them here. Registration is explicit — nothing happens
// by import side-effects.

use spine_runtime::PipelineRegistry;

pub fn register_pipelines(_registry: &PipelineRegistry) {
    // e.g. _registry.register(Arc::new(finra_otc::IngestWeekPipeline::new()));
}
