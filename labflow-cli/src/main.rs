//! Labflow command line
//!
//! Inspect workflow templates, plan workflow definitions and dry-run them
//! with echo agents:
//! - `templates`: list available templates
//! - `plan`: print the execution order of a definition
//! - `simulate`: run a definition with echo agents and print the result

mod echo;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use labflow_core::agent::AgentContext;
use labflow_core::config::{LoggingSettings, Settings};
use labflow_core::orchestration::{
    TemplateCategory, WorkflowDefinition, WorkflowOrchestrator, WorkflowTemplate,
    WorkflowTemplateRegistry,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Labflow workflow tooling
#[derive(Debug, Parser)]
#[command(name = "labflow")]
#[command(about = "Plan and simulate Labflow research workflows")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory of additional JSON workflow templates
    #[arg(long, global = true, env = "LABFLOW_TEMPLATES_DIR")]
    templates_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List workflow templates
    Templates {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        /// Case-insensitive search over name, description and tags
        #[arg(long)]
        search: Option<String>,
    },
    /// Print the execution order of a workflow
    Plan(WorkflowSource),
    /// Execute a workflow with echo agents
    Simulate {
        #[command(flatten)]
        source: WorkflowSource,
        /// Acting user id passed to agents
        #[arg(long)]
        user: Option<String>,
    },
}

/// Where the workflow definition comes from
#[derive(Debug, Args)]
struct WorkflowSource {
    /// JSON workflow definition file
    #[arg(long, conflicts_with = "template", required_unless_present = "template")]
    definition: Option<PathBuf>,

    /// Template id to instantiate
    #[arg(long)]
    template: Option<String>,

    /// JSON input file for the template
    #[arg(long, requires = "template")]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())
        .with_context(|| "Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        settings.logging.level = level.clone();
    }

    init_tracing(&settings.logging);
    debug!("Configuration loaded: {:?}", settings);

    let templates = load_templates(cli.templates_dir.as_deref()).await?;

    match cli.command {
        Command::Templates {
            category,
            tag,
            search,
        } => list_templates(&templates, category, tag, search),
        Command::Plan(source) => {
            let context = AgentContext::new();
            let definition = resolve_definition(&source, &templates, &context).await?;
            let orchestrator = echo_orchestrator(&definition, &settings);
            let order = orchestrator.plan(&definition)?;
            print_json(&json!({
                "workflow": definition.name,
                "execution_order": order,
            }))
        }
        Command::Simulate { source, user } => {
            let context = match user {
                Some(user) => AgentContext::for_user(user),
                None => AgentContext::new(),
            };
            let definition = resolve_definition(&source, &templates, &context).await?;
            let orchestrator = echo_orchestrator(&definition, &settings);

            info!("Simulating workflow '{}'", definition.name);
            let result = orchestrator.execute(&definition, &context).await.map_err(|e| {
                error!("Workflow '{}' could not run: {}", definition.name, e);
                e
            })?;
            print_json(&serde_json::to_value(&result)?)
        }
    }
}

/// Initialise logging on stderr, keeping stdout for command output
fn init_tracing(logging: &LoggingSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("labflow_core={0},labflow_cli={0}", logging.level).into());
    let json_output = logging.format == "json";

    tracing_subscriber::registry()
        .with(filter)
        .with(json_output.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json_output).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

async fn load_templates(dir: Option<&Path>) -> anyhow::Result<WorkflowTemplateRegistry> {
    let mut templates = WorkflowTemplateRegistry::with_defaults();
    if let Some(dir) = dir {
        let loaded = templates
            .load_directory(dir)
            .await
            .with_context(|| format!("Failed to load templates from {}", dir.display()))?;
        info!("Loaded {} templates from {}", loaded, dir.display());
    }
    Ok(templates)
}

fn list_templates(
    templates: &WorkflowTemplateRegistry,
    category: Option<String>,
    tag: Option<String>,
    search: Option<String>,
) -> anyhow::Result<()> {
    let selected = select_templates(templates, category, tag, search)?;
    print_json(&serde_json::to_value(&selected)?)
}

fn select_templates(
    templates: &WorkflowTemplateRegistry,
    category: Option<String>,
    tag: Option<String>,
    search: Option<String>,
) -> anyhow::Result<Vec<&WorkflowTemplate>> {
    let mut selected: Vec<&WorkflowTemplate> = match (&category, &tag, &search) {
        (Some(category), _, _) => {
            templates.templates_by_category(category.parse::<TemplateCategory>()?)
        }
        (None, Some(tag), _) => templates.templates_by_tag(tag),
        (None, None, Some(query)) => templates.search_templates(query),
        (None, None, None) => templates.all_templates(),
    };

    // remaining filters narrow the first one
    if let Some(tag) = tag.as_deref().filter(|_| category.is_some()) {
        selected.retain(|t| t.tags.iter().any(|own| own == tag));
    }
    if let Some(query) = search.as_deref().filter(|_| category.is_some() || tag.is_some()) {
        selected.retain(|t| t.matches(query));
    }
    Ok(selected)
}

async fn resolve_definition(
    source: &WorkflowSource,
    templates: &WorkflowTemplateRegistry,
    context: &AgentContext,
) -> anyhow::Result<WorkflowDefinition> {
    match (&source.definition, &source.template) {
        (Some(path), _) => {
            let raw = read_file(path).await?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid workflow definition in {}", path.display()))
        }
        (None, Some(template_id)) => {
            let input = match &source.input {
                Some(path) => {
                    let raw = read_file(path).await?;
                    serde_json::from_str::<Value>(&raw)
                        .with_context(|| format!("Invalid template input in {}", path.display()))?
                }
                None => json!({}),
            };
            Ok(templates.create_workflow_from_template(template_id, &input, context)?)
        }
        (None, None) => bail!("Either --definition or --template is required"),
    }
}

async fn read_file(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// Orchestrator whose registry has an echo agent for every agent type in `definition`
fn echo_orchestrator(definition: &WorkflowDefinition, settings: &Settings) -> WorkflowOrchestrator {
    let agent_types: BTreeSet<&str> = definition
        .tasks
        .iter()
        .map(|t| t.agent_type.as_str())
        .collect();
    let registry = echo::echo_registry(agent_types);
    WorkflowOrchestrator::new(Arc::new(registry), settings.orchestrator.clone())
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use labflow_core::orchestration::WorkflowTask;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate_with_template() {
        let cli = Cli::try_parse_from([
            "labflow",
            "--log-level",
            "debug",
            "simulate",
            "--template",
            "abstract-writing",
            "--input",
            "input.json",
        ])
        .unwrap();

        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Simulate { source, user } => {
                assert_eq!(source.template.as_deref(), Some("abstract-writing"));
                assert_eq!(source.input, Some(PathBuf::from("input.json")));
                assert!(user.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_plan_requires_a_source() {
        assert!(Cli::try_parse_from(["labflow", "plan"]).is_err());
        assert!(Cli::try_parse_from([
            "labflow",
            "plan",
            "--definition",
            "a.json",
            "--template",
            "b"
        ])
        .is_err());
    }

    #[test]
    fn test_filters_narrow_each_other() {
        let templates = WorkflowTemplateRegistry::with_defaults();
        let ids = |selected: Vec<&WorkflowTemplate>| -> Vec<String> {
            selected.into_iter().map(|t| t.id.clone()).collect()
        };

        let papers = select_templates(&templates, Some("paper".into()), None, None).unwrap();
        assert!(papers.len() > 1);

        let quick = select_templates(
            &templates,
            Some("paper".into()),
            None,
            Some("QUICK".into()),
        )
        .unwrap();
        assert_eq!(ids(quick), vec!["paper-writing-quick"]);

        assert!(select_templates(&templates, Some("nonsense".into()), None, None).is_err());
    }

    #[tokio::test]
    async fn test_resolve_definition_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("workflow.json");
        let definition = WorkflowDefinition::new("custom", "")
            .with_task(WorkflowTask::new("a", "reader", json!({})))
            .with_task(WorkflowTask::new("b", "writer", json!({})).depends_on("a"));
        std::fs::write(&path, serde_json::to_string(&definition).unwrap()).unwrap();

        let source = WorkflowSource {
            definition: Some(path),
            template: None,
            input: None,
        };
        let templates = WorkflowTemplateRegistry::with_defaults();
        let loaded = resolve_definition(&source, &templates, &AgentContext::new())
            .await
            .unwrap();
        assert_eq!(loaded, definition);

        let orchestrator = echo_orchestrator(&loaded, &Settings::default());
        assert_eq!(orchestrator.plan(&loaded).unwrap(), vec!["a", "b"]);
    }
}
