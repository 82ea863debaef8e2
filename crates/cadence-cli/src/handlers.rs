//! Command handlers.

use crate::commands::PlanMode;
use crate::config::{Workspace, WorkspaceFile};
use crate::simulation::{self, SimulationOptions};
use anyhow::{Context, bail};
use cadence_core::build::{BuildOutcome, BuildReason, BuildRequestEvent};
use cadence_core::project::{ProjectState, TriggerAcceptance};
use cadence_scheduler::{BuildRequestExpander, QueuedRequest};
use console::style;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

fn load(path: &str) -> anyhow::Result<Workspace> {
    let file = WorkspaceFile::load(Path::new(path)).with_context(|| format!("Unable to load {path}"))?;
    Ok(file.resolve()?)
}

/// Validate a workspace file.
pub fn validate(path: &str) -> anyhow::Result<()> {
    let workspace = load(path)?;

    println!("{} Workspace \"{}\" is valid", style("✓").green(), path);
    println!("  Projects: {}", workspace.projects.len());
    for node in workspace.graph.projects() {
        let dependencies: Vec<String> = workspace
            .graph
            .dependencies(node.id)
            .into_iter()
            .map(|(dep, edge)| {
                if edge.propagate_revision {
                    format!("{}*", dep.name)
                } else {
                    dep.name.clone()
                }
            })
            .collect();
        if dependencies.is_empty() {
            println!("    - {}", node.name);
        } else {
            println!("    - {} <- {}", node.name, dependencies.join(", "));
        }
    }

    println!("  Agents: {}", workspace.agents.len());
    for agent in &workspace.agents {
        let resources: Vec<&str> = agent.resources.keys().map(String::as_str).collect();
        println!(
            "    - {} ({:?}) {}",
            agent.name,
            agent.status,
            style(resources.join(", ")).dim()
        );
    }

    for setup in &workspace.projects {
        for stage in &setup.build_file.stages {
            let runnable = workspace
                .agents
                .iter()
                .filter(|a| a.is_online())
                .any(|a| a.satisfies_all(&stage.requirements));
            if !runnable {
                println!(
                    "{} Stage {}/{} cannot run on any online agent",
                    style("!").yellow(),
                    setup.project.name,
                    stage.name
                );
            }
        }
    }
    Ok(())
}

/// Print the wave one trigger expands into.
pub fn plan(path: &str, project: &str, mode: PlanMode, json: bool) -> anyhow::Result<()> {
    let workspace = load(path)?;
    let Some(node) = workspace.graph.project_by_name(project) else {
        bail!("Unknown project: {project}");
    };

    let reason = match mode {
        PlanMode::Rebuild => BuildReason::Rebuild,
        PlanMode::Single | PlanMode::Forward => BuildReason::Manual,
    };
    let trigger = BuildRequestEvent::new(node.id, &node.name, reason)
        .with_priority(node.priority)
        .with_rebuild(mode == PlanMode::Rebuild);
    let expander = BuildRequestExpander::new(Arc::clone(&workspace.graph));
    let wave = expander.expand(trigger, mode.into());

    if json {
        println!("{}", serde_json::to_string_pretty(&wave)?);
        return Ok(());
    }

    println!(
        "{} {} expands to {} build(s)",
        style("▶").cyan(),
        style(project).bold(),
        wave.len()
    );
    for line in plan_lines(&wave) {
        println!("  {line}");
    }
    Ok(())
}

/// Labels requests that build against the same revision with the same letter.
fn revision_groups(wave: &[QueuedRequest]) -> Vec<char> {
    let mut groups: HashMap<usize, char> = HashMap::new();
    wave.iter()
        .map(|q| {
            let next = char::from(b'A' + (groups.len() % 26) as u8);
            *groups
                .entry(Arc::as_ptr(&q.request.revision) as usize)
                .or_insert(next)
        })
        .collect()
}

fn plan_lines(wave: &[QueuedRequest]) -> Vec<String> {
    let names: HashMap<_, _> = wave
        .iter()
        .map(|q| (q.id(), q.request.project_name.as_str()))
        .collect();
    wave.iter()
        .zip(revision_groups(wave))
        .enumerate()
        .map(|(i, (queued, group))| {
            let after: Vec<&str> = queued
                .dependencies()
                .filter_map(|id| names.get(&id).copied())
                .collect();
            let after = if after.is_empty() {
                "-".to_string()
            } else {
                after.join(", ")
            };
            format!(
                "{}. {} [revision {}] after: {}",
                i + 1,
                queued.request.project_name,
                group,
                after
            )
        })
        .collect()
}

/// Print the project state machine.
pub fn states() -> anyhow::Result<()> {
    for state in ProjectState::ALL {
        let accepts = match state.info().accepts {
            TriggerAcceptance::Always => "all triggers",
            TriggerAcceptance::PersonalOnly => "personal triggers",
            TriggerAcceptance::Never => "no triggers",
        };
        println!(
            "{} {}",
            style(state).bold(),
            style(format!(
                "(initialised: {}, building: {}, accepts {})",
                state.is_initialised(),
                state.is_building(),
                accepts
            ))
            .dim()
        );
        for transition in state.valid_transitions() {
            println!("    {} -> {}", transition, state.transition(transition)?);
        }
    }
    Ok(())
}

/// Run triggers through a local scheduler.
pub async fn simulate(path: &str, options: SimulationOptions) -> anyhow::Result<()> {
    let workspace = load(path)?;
    let report = simulation::run(&workspace, &options).await?;

    for line in &report.timeline {
        println!("{} {}", style("•").dim(), line);
    }

    println!();
    for (project, outcome) in &report.completed {
        let mark = match outcome {
            BuildOutcome::Success => style("✓").green(),
            BuildOutcome::Cancelled | BuildOutcome::Terminated => style("-").yellow(),
            BuildOutcome::Failure | BuildOutcome::Error => style("✗").red(),
        };
        println!("{} {} ({:?})", mark, project, outcome);
    }
    if report.unfinished > 0 || report.pending_recipes > 0 {
        println!(
            "{} {} build(s) still running, {} recipe(s) waiting for an agent",
            style("!").yellow(),
            report.unfinished,
            report.pending_recipes
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ids::ProjectId;
    use cadence_scheduler::{ExpansionMode, ProjectGraph};
    use pretty_assertions::assert_eq;

    fn chain(propagate: bool) -> Arc<ProjectGraph> {
        Arc::new(
            ProjectGraph::builder()
                .project(ProjectId::new(), "core")
                .project(ProjectId::new(), "app")
                .dependency("app", "core", propagate)
                .build()
                .unwrap(),
        )
    }

    fn wave(graph: &Arc<ProjectGraph>) -> Vec<QueuedRequest> {
        let core = graph.project_by_name("core").unwrap();
        BuildRequestExpander::new(Arc::clone(graph)).expand(
            BuildRequestEvent::new(core.id, "core", BuildReason::Manual),
            ExpansionMode::Forward,
        )
    }

    #[test]
    fn test_shared_revision_groups() {
        assert_eq!(revision_groups(&wave(&chain(true))), vec!['A', 'A']);
        assert_eq!(revision_groups(&wave(&chain(false))), vec!['A', 'B']);
    }

    #[test]
    fn test_plan_lines() {
        let lines = plan_lines(&wave(&chain(false)));

        assert_eq!(
            lines,
            vec![
                "1. core [revision A] after: -".to_string(),
                "2. app [revision B] after: core".to_string(),
            ]
        );
    }
}
