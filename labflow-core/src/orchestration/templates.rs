//! Workflow templates
//!
//! A template turns a small input object into a full [`WorkflowDefinition`].
//! The registry ships with the built-in research templates and can load
//! further declarative templates from a directory of JSON files.
//!
//! A declarative template file holds the template metadata plus a `workflow`
//! body. Strings in the body may reference the caller's input with
//! `{{input.<field>}}` (optionally followed by a nested path); these are
//! rendered when the workflow is created. Runtime references such as
//! `{{task.result}}` are left in place for the orchestrator.

use super::models::{SynthesisStrategy, WorkflowDefinition, WorkflowTask};
use crate::agent::AgentContext;
use crate::{Error, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds a workflow from merged template input
pub type WorkflowBuilder =
    Arc<dyn Fn(&Map<String, Value>, &AgentContext) -> Result<WorkflowDefinition> + Send + Sync>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    Paper,
    Analysis,
    Experiment,
    Presentation,
    Writing,
    Other,
}

impl TemplateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateCategory::Paper => "paper",
            TemplateCategory::Analysis => "analysis",
            TemplateCategory::Experiment => "experiment",
            TemplateCategory::Presentation => "presentation",
            TemplateCategory::Writing => "writing",
            TemplateCategory::Other => "other",
        }
    }
}

impl fmt::Display for TemplateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(TemplateCategory::Paper),
            "analysis" => Ok(TemplateCategory::Analysis),
            "experiment" => Ok(TemplateCategory::Experiment),
            "presentation" => Ok(TemplateCategory::Presentation),
            "writing" => Ok(TemplateCategory::Writing),
            "other" => Ok(TemplateCategory::Other),
            _ => Err(Error::validation(format!("Unknown template category '{}'", s))),
        }
    }
}

/// Description of one template input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputField {
    #[serde(rename = "type")]
    pub field_type: String,
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl InputField {
    pub fn required(field_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            field_type: field_type.into(),
            description: description.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(
        field_type: impl Into<String>,
        description: impl Into<String>,
        default: Value,
    ) -> Self {
        Self {
            field_type: field_type.into(),
            description: description.into(),
            required: false,
            default: Some(default),
        }
    }
}

/// A reusable workflow recipe
#[derive(Clone, Serialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: TemplateCategory,
    pub tags: Vec<String>,
    pub estimated_duration_minutes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    pub required_input: BTreeMap<String, InputField>,
    pub optional_input: BTreeMap<String, InputField>,
    #[serde(skip)]
    builder: WorkflowBuilder,
}

impl fmt::Debug for WorkflowTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowTemplate")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("category", &self.category)
            .field("tags", &self.tags)
            .finish()
    }
}

impl WorkflowTemplate {
    pub fn new<F>(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        category: TemplateCategory,
        builder: F,
    ) -> Self
    where
        F: Fn(&Map<String, Value>, &AgentContext) -> Result<WorkflowDefinition>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            category,
            tags: Vec::new(),
            estimated_duration_minutes: 0,
            estimated_cost: None,
            required_input: BTreeMap::new(),
            optional_input: BTreeMap::new(),
            builder: Arc::new(builder),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.estimated_duration_minutes = minutes;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = Some(cost);
        self
    }

    pub fn with_required(mut self, key: impl Into<String>, field: InputField) -> Self {
        self.required_input.insert(key.into(), field);
        self
    }

    pub fn with_optional(mut self, key: impl Into<String>, field: InputField) -> Self {
        self.optional_input.insert(key.into(), field);
        self
    }

    /// Case-insensitive match on name, description and tags
    pub fn matches(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.name.to_lowercase().contains(&query)
            || self.description.to_lowercase().contains(&query)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&query))
    }

    /// Check required fields and merge optional defaults beneath `input`
    fn prepare_input(&self, input: &Value) -> Result<Map<String, Value>> {
        let provided = match input {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => {
                return Err(Error::validation(format!(
                    "Input for template '{}' must be an object",
                    self.id
                )))
            }
        };

        for (key, field) in self.required_input.iter().filter(|(_, f)| f.required) {
            let missing = match provided.get(key) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            };
            if missing {
                return Err(Error::missing_input(key, &field.description));
            }
        }

        let mut merged: Map<String, Value> = self
            .optional_input
            .iter()
            .filter_map(|(key, field)| field.default.clone().map(|d| (key.clone(), d)))
            .collect();
        merged.extend(provided);
        Ok(merged)
    }
}

/// Template catalogue keyed by template id
#[derive(Debug, Clone, Default)]
pub struct WorkflowTemplateRegistry {
    templates: BTreeMap<String, WorkflowTemplate>,
}

impl WorkflowTemplateRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in templates
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for template in builtin_templates() {
            registry.register_template(template);
        }
        registry
    }

    /// Add a template, replacing any template with the same id
    pub fn register_template(&mut self, template: WorkflowTemplate) {
        debug!(template_id = %template.id, "Registering workflow template");
        self.templates.insert(template.id.clone(), template);
    }

    pub fn get_template(&self, template_id: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(template_id)
    }

    pub fn all_templates(&self) -> Vec<&WorkflowTemplate> {
        self.templates.values().collect()
    }

    pub fn templates_by_category(&self, category: TemplateCategory) -> Vec<&WorkflowTemplate> {
        self.templates
            .values()
            .filter(|t| t.category == category)
            .collect()
    }

    pub fn templates_by_tag(&self, tag: &str) -> Vec<&WorkflowTemplate> {
        self.templates
            .values()
            .filter(|t| t.tags.iter().any(|own| own == tag))
            .collect()
    }

    /// Case-insensitive match on name, description and tags
    pub fn search_templates(&self, query: &str) -> Vec<&WorkflowTemplate> {
        self.templates.values().filter(|t| t.matches(query)).collect()
    }

    /// Build a workflow definition from a template and caller input
    pub fn create_workflow_from_template(
        &self,
        template_id: &str,
        input: &Value,
        context: &AgentContext,
    ) -> Result<WorkflowDefinition> {
        let template = self
            .get_template(template_id)
            .ok_or_else(|| Error::not_found("template", template_id))?;

        let merged = template.prepare_input(input)?;
        (template.builder)(&merged, context)
    }

    /// Load every `*.json` template in `dir`, returning how many were added
    pub async fn load_directory(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            Error::configuration(format!(
                "Cannot read template directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut paths: Vec<PathBuf> = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            Error::configuration(format!(
                "Cannot read template directory {}: {}",
                dir.display(),
                e
            ))
        })? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let renderer = InputRenderer::new()?;
        for path in &paths {
            let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::configuration(format!("Cannot read template {}: {}", path.display(), e))
            })?;
            let file: TemplateFile = serde_json::from_str(&raw).map_err(|e| {
                Error::configuration(format!("Invalid template {}: {}", path.display(), e))
            })?;
            let template = file.into_template(renderer.clone()).map_err(|e| {
                Error::configuration(format!("Invalid template {}: {}", path.display(), e))
            })?;
            self.register_template(template);
        }

        info!(
            directory = %dir.display(),
            count = paths.len(),
            "Loaded workflow templates"
        );
        Ok(paths.len())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// On-disk form of a declarative template
#[derive(Debug, Deserialize)]
struct TemplateFile {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_category")]
    category: TemplateCategory,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    estimated_duration_minutes: u32,
    #[serde(default)]
    estimated_cost: Option<f64>,
    #[serde(default)]
    required_input: BTreeMap<String, InputField>,
    #[serde(default)]
    optional_input: BTreeMap<String, InputField>,
    workflow: Value,
}

fn default_category() -> TemplateCategory {
    TemplateCategory::Other
}

impl TemplateFile {
    fn into_template(self, renderer: InputRenderer) -> Result<WorkflowTemplate> {
        let has_tasks = self
            .workflow
            .get("tasks")
            .is_some_and(|tasks| tasks.as_array().is_some_and(|t| !t.is_empty()));
        if !has_tasks {
            return Err(Error::validation("workflow body needs a non-empty 'tasks' array"));
        }

        let body = self.workflow;
        let template_id = self.id.clone();
        let mut template = WorkflowTemplate::new(
            self.id,
            self.name,
            self.description,
            self.category,
            move |input, _context| {
                let rendered = renderer.render(&body, input);
                serde_json::from_value(rendered).map_err(|e| {
                    Error::validation(format!(
                        "Template '{}' produced an invalid workflow: {}",
                        template_id, e
                    ))
                })
            },
        );
        template.tags = self.tags;
        template.estimated_duration_minutes = self.estimated_duration_minutes;
        template.estimated_cost = self.estimated_cost;
        template.required_input = self.required_input;
        template.optional_input = self.optional_input;
        Ok(template)
    }
}

/// Renders `{{input.<path>}}` references in a declarative workflow body
#[derive(Debug, Clone)]
struct InputRenderer {
    pattern: Regex,
}

impl InputRenderer {
    fn new() -> Result<Self> {
        let pattern = Regex::new(r"\{\{\s*input((?:\.[A-Za-z0-9_\-]+)+)\s*\}\}")
            .map_err(|e| Error::Internal(format!("Invalid input placeholder pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    fn render(&self, value: &Value, input: &Map<String, Value>) -> Value {
        match value {
            Value::String(s) => self.render_str(s, input),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.render(v, input)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render(v, input)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn render_str(&self, s: &str, input: &Map<String, Value>) -> Value {
        let Some(captures) = self.pattern.captures(s) else {
            return Value::String(s.to_string());
        };
        if captures.get(0).is_some_and(|m| m.as_str() == s.trim()) {
            return lookup_path(input, &captures[1]);
        }

        let rendered = self.pattern.replace_all(s, |captures: &Captures| {
            match lookup_path(input, &captures[1]) {
                Value::Null => String::new(),
                Value::String(text) => text,
                other => other.to_string(),
            }
        });
        Value::String(rendered.into_owned())
    }
}

fn lookup_path(input: &Map<String, Value>, path: &str) -> Value {
    let mut segments = path.split('.').filter(|s| !s.is_empty());
    let Some(first) = segments.next().and_then(|key| input.get(key)) else {
        return Value::Null;
    };

    let mut current = first;
    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn field(input: &Map<String, Value>, key: &str) -> Value {
    input.get(key).cloned().unwrap_or(Value::Null)
}

fn nested(input: &Map<String, Value>, key: &str, inner: &str) -> Value {
    input
        .get(key)
        .and_then(|v| v.get(inner))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Built-in research templates
pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![
        paper_generation_full(),
        paper_writing_quick(),
        presentation_generation(),
        literature_review(),
        experiment_design(),
        abstract_writing(),
    ]
}

fn data_source_input(input: &Map<String, Value>, with_file_type: bool) -> Value {
    let mut source = json!({
        "data_source": nested(input, "data_source", "type"),
        "source_id": nested(input, "data_source", "source_id"),
        "file_path": nested(input, "data_source", "file_path"),
        "file_content": nested(input, "data_source", "file_content"),
    });
    if with_file_type {
        source["file_type"] = nested(input, "data_source", "file_type");
    }
    source
}

fn paper_generation_full() -> WorkflowTemplate {
    WorkflowTemplate::new(
        "paper-generation-full",
        "Complete Paper Generation",
        "Generate a complete research paper from data: read data, analyze, write paper, create figures, add references and compile a draft",
        TemplateCategory::Paper,
        |input, _context| {
            let research_question = field(input, "research_question");
            let target = field(input, "target");
            let citation_style = target
                .get("style")
                .filter(|s| !s.is_null())
                .cloned()
                .unwrap_or_else(|| json!("APA"));

            let description = "Full paper generation workflow";
            Ok(WorkflowDefinition::new("Complete Paper Generation", description)
                .with_strategy(SynthesisStrategy::Sequential)
                .with_task(
                    WorkflowTask::new("read_data", "data_reading", data_source_input(input, true))
                        .with_priority(1),
                )
                .with_task(
                    WorkflowTask::new(
                        "analyze_data",
                        "data_analysis",
                        json!({
                            "research_question": research_question,
                            "data": "{{read_data.result}}",
                        }),
                    )
                    .depends_on("read_data")
                    .with_priority(2),
                )
                .with_task(
                    WorkflowTask::new(
                        "write_paper",
                        "paper_writing",
                        json!({
                            "research_question": research_question,
                            "data": "{{read_data.result}}",
                            "context": { "methodology": "{{analyze_data.result}}" },
                            "style": target,
                        }),
                    )
                    .with_dependencies(["read_data", "analyze_data"])
                    .with_priority(3),
                )
                .with_task(
                    WorkflowTask::new(
                        "generate_figures",
                        "figure_generation",
                        json!({
                            "data": "{{read_data.result}}",
                            "purpose": "Visualize research findings",
                        }),
                    )
                    .depends_on("read_data")
                    .with_priority(3),
                )
                .with_task(
                    WorkflowTask::new(
                        "add_references",
                        "reference_management",
                        json!({
                            "content": "{{write_paper.result}}",
                            "topics": [research_question],
                            "citation_style": citation_style,
                        }),
                    )
                    .depends_on("write_paper")
                    .with_priority(4),
                )
                .with_task(
                    WorkflowTask::new(
                        "compile_draft",
                        "draft_compilation",
                        json!({
                            "sections": "{{write_paper.result}}",
                            "references": "{{add_references.result}}",
                        }),
                    )
                    .with_dependencies(["write_paper", "add_references"])
                    .with_priority(5),
                ))
        },
    )
    .with_tags(&["paper", "writing", "data", "figures", "references"])
    .with_duration(30)
    .with_required(
        "data_source",
        InputField::required(
            "object",
            "Data source information (type, source_id, file_path, etc.)",
        ),
    )
    .with_required(
        "research_question",
        InputField::required("string", "Main research question"),
    )
    .with_optional(
        "target",
        InputField::optional("object", "Target journal/conference", json!({ "style": "APA" })),
    )
}

fn paper_writing_quick() -> WorkflowTemplate {
    WorkflowTemplate::new(
        "paper-writing-quick",
        "Quick Paper Writing",
        "Generate paper sections from existing data and research question",
        TemplateCategory::Paper,
        |input, _context| {
            let style = match field(input, "style") {
                Value::Null => json!("APA"),
                style => style,
            };
            Ok(WorkflowDefinition::new("Quick Paper Writing", "Fast paper generation").with_task(
                WorkflowTask::new(
                    "write_paper",
                    "paper_writing",
                    json!({
                        "research_question": field(input, "research_question"),
                        "data": field(input, "data"),
                        "style": { "format": style },
                    }),
                )
                .with_priority(1),
            ))
        },
    )
    .with_tags(&["paper", "writing", "quick"])
    .with_duration(15)
    .with_required(
        "research_question",
        InputField::required("string", "Main research question"),
    )
    .with_required("data", InputField::required("any", "Research data or content"))
    .with_optional("style", InputField::optional("string", "Citation style", json!("APA")))
}

fn presentation_generation() -> WorkflowTemplate {
    WorkflowTemplate::new(
        "presentation-generation",
        "Presentation Generation",
        "Generate presentation slides from research data or paper",
        TemplateCategory::Presentation,
        |input, _context| {
            let description = "Generate presentation from research";
            Ok(WorkflowDefinition::new("Presentation Generation", description)
                .with_task(
                    WorkflowTask::new("read_data", "data_reading", data_source_input(input, false))
                        .with_priority(1),
                )
                .with_task(
                    WorkflowTask::new(
                        "analyze_data",
                        "data_analysis",
                        json!({ "data": "{{read_data.result}}" }),
                    )
                    .depends_on("read_data")
                    .with_priority(2),
                )
                .with_task(
                    WorkflowTask::new(
                        "generate_slides",
                        "presentation_slide",
                        json!({
                            "source": {
                                "type": nested(input, "data_source", "type"),
                                "content": "{{read_data.result}}",
                                "data": "{{analyze_data.result}}",
                            },
                            "presentation_type": field(input, "presentation_type"),
                            "duration": field(input, "duration"),
                        }),
                    )
                    .with_dependencies(["read_data", "analyze_data"])
                    .with_priority(3),
                )
                .with_task(
                    WorkflowTask::new(
                        "generate_figures",
                        "figure_generation",
                        json!({
                            "data": "{{read_data.result}}",
                            "purpose": "Visualize for presentation",
                        }),
                    )
                    .depends_on("read_data")
                    .with_priority(3),
                ))
        },
    )
    .with_tags(&["presentation", "slides", "data"])
    .with_duration(20)
    .with_required("data_source", InputField::required("object", "Data source or paper ID"))
    .with_optional(
        "presentation_type",
        InputField::optional("string", "Type of presentation", json!("conference")),
    )
    .with_optional(
        "duration",
        InputField::optional("number", "Presentation duration in minutes", json!(15)),
    )
}

fn literature_review() -> WorkflowTemplate {
    WorkflowTemplate::new(
        "literature-review",
        "Literature Review",
        "Conduct comprehensive literature review on a topic",
        TemplateCategory::Analysis,
        |input, _context| {
            let topic = field(input, "topic");
            let max_papers = field(input, "max_papers");
            Ok(WorkflowDefinition::new("Literature Review", "Comprehensive literature review")
                .with_task(
                    WorkflowTask::new(
                        "find_papers",
                        "paper_finding",
                        json!({ "topic": topic, "max_results": max_papers }),
                    )
                    .with_priority(1),
                )
                .with_task(
                    WorkflowTask::new(
                        "literature_review",
                        "literature_review",
                        json!({
                            "topic": topic,
                            "papers": "{{find_papers.result}}",
                            "max_papers": max_papers,
                        }),
                    )
                    .depends_on("find_papers")
                    .with_priority(2),
                ))
        },
    )
    .with_tags(&["literature", "review", "research"])
    .with_duration(25)
    .with_required("topic", InputField::required("string", "Research topic"))
    .with_optional(
        "max_papers",
        InputField::optional("number", "Maximum number of papers", json!(20)),
    )
}

fn experiment_design() -> WorkflowTemplate {
    WorkflowTemplate::new(
        "experiment-design",
        "Experiment Design",
        "Design experiment and analyze results",
        TemplateCategory::Experiment,
        |input, _context| {
            let research_question = field(input, "research_question");
            let constraints = match field(input, "constraints") {
                Value::Null => json!({}),
                constraints => constraints,
            };
            Ok(WorkflowDefinition::new("Experiment Design", "Design and analyze experiment")
                .with_task(
                    WorkflowTask::new(
                        "design_experiment",
                        "experiment_design",
                        json!({
                            "research_question": research_question,
                            "constraints": constraints,
                        }),
                    )
                    .with_priority(1),
                )
                .with_task(
                    WorkflowTask::new(
                        "analyze_data",
                        "data_analysis",
                        json!({
                            "research_question": research_question,
                            "data": "Experimental data",
                        }),
                    )
                    .depends_on("design_experiment")
                    .with_priority(2),
                ))
        },
    )
    .with_tags(&["experiment", "design", "analysis"])
    .with_duration(20)
    .with_required("research_question", InputField::required("string", "Research question"))
    .with_optional(
        "constraints",
        InputField::optional("object", "Experimental constraints", json!({})),
    )
}

fn abstract_writing() -> WorkflowTemplate {
    WorkflowTemplate::new(
        "abstract-writing",
        "Abstract Writing",
        "Generate abstract from research content",
        TemplateCategory::Writing,
        |input, _context| {
            Ok(WorkflowDefinition::new("Abstract Writing", "Generate research abstract").with_task(
                WorkflowTask::new(
                    "write_abstract",
                    "abstract_writing",
                    json!({
                        "content": field(input, "content"),
                        "word_limit": field(input, "word_limit"),
                    }),
                )
                .with_priority(1),
            ))
        },
    )
    .with_tags(&["abstract", "writing", "quick"])
    .with_duration(5)
    .with_required("content", InputField::required("string", "Research content or data"))
    .with_optional(
        "word_limit",
        InputField::optional("number", "Word limit for abstract", json!(250)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_catalogue() {
        let registry = WorkflowTemplateRegistry::with_defaults();
        assert_eq!(registry.len(), 6);

        assert_eq!(registry.templates_by_category(TemplateCategory::Paper).len(), 2);
        assert_eq!(registry.templates_by_tag("quick").len(), 2);

        let ids: Vec<&str> = registry
            .search_templates("SLIDES")
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ids, vec!["presentation-generation"]);
    }

    #[rstest]
    #[case("paper", TemplateCategory::Paper)]
    #[case("Writing", TemplateCategory::Writing)]
    #[case("other", TemplateCategory::Other)]
    fn test_category_parsing(#[case] raw: &str, #[case] expected: TemplateCategory) {
        assert_eq!(raw.parse::<TemplateCategory>().unwrap(), expected);
    }

    #[test]
    fn test_full_paper_workflow() {
        let registry = WorkflowTemplateRegistry::with_defaults();
        let definition = registry
            .create_workflow_from_template(
                "paper-generation-full",
                &json!({
                    "data_source": { "type": "csv", "file_path": "assay.csv" },
                    "research_question": "Does temperature affect yield?"
                }),
                &AgentContext::new(),
            )
            .unwrap();

        assert_eq!(definition.tasks.len(), 6);
        assert_eq!(definition.synthesis_strategy, SynthesisStrategy::Sequential);

        let read = definition.task("read_data").unwrap();
        assert_eq!(read.input["data_source"], json!("csv"));
        assert_eq!(read.input["file_path"], json!("assay.csv"));

        let write = definition.task("write_paper").unwrap();
        assert_eq!(write.dependencies, vec!["read_data", "analyze_data"]);
        assert_eq!(write.input["context"]["methodology"], json!("{{analyze_data.result}}"));
        assert_eq!(write.input["style"], json!({ "style": "APA" }));

        let refs = definition.task("add_references").unwrap();
        assert_eq!(refs.input["citation_style"], json!("APA"));
        assert_eq!(refs.input["topics"], json!(["Does temperature affect yield?"]));
        assert_eq!(definition.task("compile_draft").unwrap().priority, 5);
    }

    #[test]
    fn test_optional_defaults_yield_to_caller_input() {
        let registry = WorkflowTemplateRegistry::with_defaults();
        let definition = registry
            .create_workflow_from_template(
                "literature-review",
                &json!({ "topic": "CRISPR delivery" }),
                &AgentContext::new(),
            )
            .unwrap();
        assert_eq!(definition.tasks[0].input["max_results"], json!(20));

        let definition = registry
            .create_workflow_from_template(
                "literature-review",
                &json!({ "topic": "CRISPR delivery", "max_papers": 5 }),
                &AgentContext::new(),
            )
            .unwrap();
        assert_eq!(definition.tasks[1].input["max_papers"], json!(5));
        assert_eq!(definition.tasks[1].input["papers"], json!("{{find_papers.result}}"));
    }

    #[rstest]
    #[case(json!({}))]
    #[case(json!({ "content": null }))]
    #[case(json!({ "content": "" }))]
    fn test_missing_required_input(#[case] input: Value) {
        let registry = WorkflowTemplateRegistry::with_defaults();
        let err = registry
            .create_workflow_from_template("abstract-writing", &input, &AgentContext::new())
            .unwrap_err();
        assert_matches!(err, Error::MissingInput { field, .. } if field == "content");
    }

    #[test]
    fn test_unknown_template() {
        let registry = WorkflowTemplateRegistry::with_defaults();
        let err = registry
            .create_workflow_from_template("nope", &json!({}), &AgentContext::new())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_load_declarative_templates() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("screen.json"),
            serde_json::to_string_pretty(&json!({
                "id": "compound-screen",
                "name": "Compound Screen",
                "description": "Screen a compound library",
                "category": "experiment",
                "tags": ["screening"],
                "required_input": {
                    "library": { "type": "string", "description": "Library name", "required": true }
                },
                "optional_input": {
                    "replicates": { "type": "number", "description": "Replicates", "default": 3 }
                },
                "workflow": {
                    "name": "Screen {{input.library}}",
                    "synthesis_strategy": "hierarchical",
                    "tasks": [
                        { "id": "plan", "agent_type": "experiment_design",
                          "input": { "library": "{{input.library}}",
                                     "replicates": "{{input.replicates}}" } },
                        { "id": "analyze", "agent_type": "data_analysis",
                          "input": { "plan": "{{plan.result}}" }, "dependencies": ["plan"] }
                    ]
                }
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a template").unwrap();

        let mut registry = WorkflowTemplateRegistry::new();
        assert_eq!(registry.load_directory(dir.path()).await.unwrap(), 1);

        let template = registry.get_template("compound-screen").unwrap();
        assert_eq!(template.category, TemplateCategory::Experiment);

        let definition = registry
            .create_workflow_from_template(
                "compound-screen",
                &json!({ "library": "kinase-v2" }),
                &AgentContext::new(),
            )
            .unwrap();
        assert_eq!(definition.name, "Screen kinase-v2");
        assert_eq!(definition.synthesis_strategy, SynthesisStrategy::Hierarchical);
        assert_eq!(definition.tasks[0].input["replicates"], json!(3));
        assert_eq!(definition.tasks[1].input["plan"], json!("{{plan.result}}"));
    }

    #[tokio::test]
    async fn test_invalid_template_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("broken.json"),
            r#"{ "id": "x", "name": "x", "workflow": { "tasks": [] } }"#,
        )
        .unwrap();

        let mut registry = WorkflowTemplateRegistry::new();
        let err = registry.load_directory(dir.path()).await.unwrap_err();
        assert_matches!(err, Error::Configuration { .. });
    }
}
