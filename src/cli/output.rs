//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use std::time::Duration;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::orchestrator::{DriftReport, OrchestrationReport, Phase, StackOutputs};
use crate::planner::{Action, DependencyGraph, DiffResult, OperationPlan, Outcome};
use crate::resource::Value;
use crate::state::{ResourceStatus, StackState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Resource status row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    id: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Name")]
    physical_name: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Operation outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Time")]
    elapsed: String,
}

/// Attribute row for table display.
#[derive(Tabled)]
struct AttributeRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true when formatting JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn json<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats an operation plan, with per-field changes when `diff` is given.
    #[must_use]
    pub fn format_plan(&self, plan: &OperationPlan, diff: Option<&DiffResult>) -> String {
        match self.format {
            OutputFormat::Json => Self::json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, diff),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &OperationPlan, diff: Option<&DiffResult>) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - stack is settled.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nOperation Plan\n");
        let _ = write!(output, "   Config hash: {}\n\n", short(&plan.config_hash));

        let rows: Vec<PlanStepRow> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| PlanStepRow {
                index: i + 1,
                action: Self::format_action(step.action, step.conditional),
                resource: format!("{} ({})", step.resource, step.resource_type),
                after: step
                    .after
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                reason: Self::truncate(&step.reason, 40),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if let Some(diff) = diff {
            let detailed: Vec<_> = diff.diffs.iter().filter(|d| !d.details.is_empty()).collect();
            if !detailed.is_empty() {
                output.push_str("\nChanges:\n");
                for resource in detailed {
                    let _ = writeln!(output, "   {}:", resource.id);
                    for detail in &resource.details {
                        let _ = writeln!(
                            output,
                            "     {}: {} -> {}",
                            detail.field,
                            detail.old_value.as_deref().unwrap_or("(none)").red(),
                            detail.new_value.as_deref().unwrap_or("(none)").green()
                        );
                    }
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete\n",
            plan.count(Action::Create).to_string().green(),
            plan.count(Action::Update).to_string().yellow(),
            plan.count(Action::Delete).to_string().red()
        );

        output
    }

    /// Formats the result of an apply or destroy pass.
    #[must_use]
    pub fn format_report(&self, report: &OrchestrationReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &OrchestrationReport) -> String {
        let mut output = String::new();

        if !report.execution.results.is_empty() {
            let rows: Vec<OutcomeRow> = report
                .execution
                .results
                .iter()
                .map(|r| OutcomeRow {
                    action: Self::format_action(r.action, false),
                    resource: r.resource.to_string(),
                    outcome: Self::format_outcome(&r.outcome),
                    elapsed: format!("{:.1}s", Duration::from_millis(r.elapsed_ms).as_secs_f64()),
                })
                .collect();
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if let Some(drift) = &report.drift
            && drift.has_drift()
        {
            output.push('\n');
            output.push_str(&Self::format_drift_text(drift));
        }

        if !report.errors.is_empty() {
            let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
            for error in &report.errors {
                let _ = writeln!(output, "   - {error}");
            }
        }

        let phase = match report.phase {
            Phase::Settled => format!("{} Stack settled", "✓".green()),
            phase => format!("{} Pass ended in phase {phase}", "✗".red()),
        };
        let _ = write!(output, "\n{phase}: {}\n", report.execution);
        output
    }

    /// Formats recorded resource status.
    #[must_use]
    pub fn format_status(&self, state: &StackState, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&state.resources),
            OutputFormat::Text => {
                let mut output = format!("\nStack: {}/{}\n\n", state.project, state.environment);

                if state.resources.is_empty() {
                    output.push_str("   No resources provisioned.\n");
                    return output;
                }

                let rows: Vec<ResourceRow> = state
                    .resources
                    .values()
                    .map(|r| ResourceRow {
                        id: r.id.to_string(),
                        resource_type: r.resource_type.to_string(),
                        status: Self::format_status_value(r.status),
                        physical_name: Self::truncate(&r.physical_name, 40),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let counts = state.status_counts();
                let _ = write!(
                    output,
                    "\n{} provisioned, {} failed, {} timed out\n",
                    counts.get(&ResourceStatus::Provisioned).copied().unwrap_or(0),
                    counts.get(&ResourceStatus::Failed).copied().unwrap_or(0),
                    counts.get(&ResourceStatus::TimedOut).copied().unwrap_or(0)
                );

                for record in state.resources.values() {
                    if let Some(error) = &record.last_error {
                        let _ = writeln!(output, "   {} {}: {error}", "✗".red(), record.id);
                    }
                    if detailed && !record.attributes.is_empty() {
                        let _ = writeln!(output, "\n   {}:", record.id);
                        for (key, value) in &record.attributes {
                            let _ = writeln!(output, "     {key} = {}", display_value(value));
                        }
                    }
                }

                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => Self::format_drift_text(report),
        }
    }

    fn format_drift_text(report: &DriftReport) -> String {
        let mut output = if report.has_drift() {
            let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
            for item in &report.drifted {
                let _ = writeln!(output, "   - {}: {}", item.resource, item.description);
            }
            output
        } else {
            format!(
                "{} No drift detected across {} resources.\n",
                "✓".green(),
                report.checked
            )
        };
        for error in &report.errors {
            let _ = writeln!(output, "   {} {error}", "✗".red());
        }
        output
    }

    /// Formats resolved attributes and named outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &StackOutputs) -> String {
        match self.format {
            OutputFormat::Json => Self::json(outputs),
            OutputFormat::Text => {
                let mut output = String::new();
                if !outputs.outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    output.push_str(&Self::attribute_table(&outputs.outputs));
                    output.push('\n');
                }
                output.push_str("\nAttributes:\n");
                if outputs.attributes.is_empty() {
                    output.push_str("   (none)\n");
                } else {
                    output.push_str(&Self::attribute_table(&outputs.attributes));
                    output.push('\n');
                }
                output
            }
        }
    }

    fn attribute_table(values: &std::collections::BTreeMap<String, Value>) -> String {
        let rows: Vec<AttributeRow> = values
            .iter()
            .map(|(key, value)| AttributeRow {
                key: key.clone(),
                value: Self::truncate(&display_value(value), 80),
            })
            .collect();
        Table::new(rows).to_string()
    }

    /// Formats the dependency graph.
    #[must_use]
    pub fn format_graph(&self, graph: &DependencyGraph, dot: bool) -> String {
        if dot {
            return graph.to_dot();
        }
        match self.format {
            OutputFormat::Json => {
                let edges: Vec<GraphEdgeJson<'_>> = graph
                    .edges()
                    .map(|(dependency, dependent, via)| GraphEdgeJson {
                        dependency: dependency.as_str(),
                        dependent: dependent.as_str(),
                        via,
                    })
                    .collect();
                Self::json(&edges)
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for node in graph.nodes() {
                    let dependencies = graph.dependencies_of(node.as_str());
                    if dependencies.is_empty() {
                        let _ = writeln!(output, "{node}");
                    } else {
                        let list: Vec<String> = dependencies.iter().map(ToString::to_string).collect();
                        let _ = writeln!(output, "{node} <- {}", list.join(", "));
                    }
                }
                output
            }
        }
    }

    /// Formats recorded state.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => Self::json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Config hash: {}", short(&state.config_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats validation warnings.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "warnings": result.warnings,
                });
                Self::json(&json)
            }
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid!\n", "✓".green());
                if show_warnings && result.warning_count() > 0 {
                    let _ = write!(output, "\n{} Warnings ({}):\n", "⚠".yellow(), result.warning_count());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats an action with color.
    fn format_action(action: Action, conditional: bool) -> String {
        match action {
            Action::Create => "+create".green().to_string(),
            Action::Update if conditional => "~refresh".cyan().to_string(),
            Action::Update => "~update".yellow().to_string(),
            Action::Delete => "-delete".red().to_string(),
        }
    }

    /// Formats an outcome with color.
    fn format_outcome(outcome: &Outcome) -> String {
        match outcome {
            Outcome::Succeeded => outcome.label().green().to_string(),
            Outcome::Unchanged => outcome.label().dimmed().to_string(),
            Outcome::Failed { error } | Outcome::TimedOut { error } => {
                format!("{}: {}", outcome.label().red(), Self::truncate(error, 60))
            }
            Outcome::Blocked { by } => format!("{} by {by}", outcome.label().yellow()),
            Outcome::Cancelled => outcome.label().yellow().to_string(),
        }
    }

    /// Formats a resource status with color.
    fn format_status_value(status: ResourceStatus) -> String {
        match status {
            ResourceStatus::Provisioned => status.to_string().green().to_string(),
            ResourceStatus::Failed | ResourceStatus::TimedOut => status.to_string().red().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

#[derive(Serialize)]
struct GraphEdgeJson<'a> {
    dependency: &'a str,
    dependent: &'a str,
    via: &'a [String],
}

fn short(hash: &str) -> &str {
    &hash[..8.min(hash.len())]
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlannedOperation;
    use crate::resource::{ResourceId, ResourceType};

    fn plan() -> OperationPlan {
        OperationPlan {
            config_hash: String::from("0123456789abcdef"),
            steps: vec![
                PlannedOperation {
                    resource: ResourceId::from("db"),
                    resource_type: ResourceType::Database,
                    action: Action::Create,
                    reason: String::from("new resource"),
                    after: Vec::new(),
                    conditional: false,
                },
                PlannedOperation {
                    resource: ResourceId::from("api"),
                    resource_type: ResourceType::ContainerService,
                    action: Action::Update,
                    reason: String::from("dependency 'db' changes"),
                    after: vec![ResourceId::from("db")],
                    conditional: true,
                },
            ],
        }
    }

    #[test]
    fn test_plan_text_summary() {
        colored::control::set_override(false);
        let output = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), None);
        assert!(output.contains("Config hash: 01234567"));
        assert!(output.contains("~refresh"));
        assert!(output.contains("Plan: 1 to create, 1 to update, 0 to delete"));
    }

    #[test]
    fn test_plan_json_is_the_plan() {
        let output = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), None);
        let parsed: OperationPlan = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed, plan());
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(OutputFormatter::truncate("ééééé", 4), "é...");
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
    }
}
