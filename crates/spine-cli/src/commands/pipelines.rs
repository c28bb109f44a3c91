// `spine pipelines` - registry inspection

use std::process::ExitCode;

use anyhow::Result;
use clap::Subcommand;

use spine_core::CoreConfig;
use spine_runtime::{DescribePipeline, ListPipelines};

use crate::output::{table, OutputFormat};

#[derive(Subcommand)]
pub enum PipelinesCommand {
    /// List registered pipelines
    List {
        /// Name prefix filter
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Show a pipeline's parameter schema
    Describe {
        /// Pipeline name
        name: String,
    },
}

pub async fn run(
    command: PipelinesCommand,
    config: &CoreConfig,
    format: OutputFormat,
) -> Result<ExitCode> {
    let runtime = super::runtime(config).await?;

    match command {
        PipelinesCommand::List { prefix } => {
            let pipelines = ListPipelines { prefix }.execute(&runtime.registry);
            format.emit(&pipelines, |pipelines| {
                if pipelines.is_empty() {
                    return "no pipelines registered".to_string();
                }
                table(
                    &["NAME", "INGEST", "DESCRIPTION"],
                    pipelines
                        .iter()
                        .map(|p| {
                            vec![
                                p.name.clone(),
                                if p.is_ingest { "yes" } else { "no" }.to_string(),
                                p.description.clone(),
                            ]
                        })
                        .collect(),
                )
            });
        }
        PipelinesCommand::Describe { name } => {
            let spec = DescribePipeline { name }.execute(&runtime.registry)?;
            format.emit(&spec, |spec| {
                let mut out = format!("{}\n  {}\n", spec.name, spec.description);
                out.push_str("  parameters:\n");
                for def in spec.all_params() {
                    out.push_str(&format!(
                        "    {} ({:?}{}){}\n",
                        def.name,
                        def.param_type,
                        if def.required { ", required" } else { "" },
                        if def.description.is_empty() {
                            String::new()
                        } else {
                            format!(" - {}", def.description)
                        },
                    ));
                }
                out.trim_end().to_string()
            });
        }
    }

    Ok(super::OK)
}
