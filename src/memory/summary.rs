use std::fmt::Write;

use anvil_common::{ExecutionMap, PhaseType};

/// Plain-text rendering of an execution map for operators.
pub fn render(map: &ExecutionMap) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Task: {}", map.task_id);
    if !map.description.is_empty() {
        let _ = writeln!(out, "Description: {}", map.description);
    }
    let _ = writeln!(out, "Status: {}", map.status);
    if let Some(phase) = map.current_phase {
        let _ = writeln!(out, "Current phase: {phase}");
    }
    let _ = writeln!(
        out,
        "Cost: ${:.2} (overhead ${:.2}), tokens: {}",
        map.total_cost, map.overhead_cost, map.total_tokens
    );
    let _ = writeln!(out, "Updated: {}", map.updated_at.to_rfc3339());

    out.push_str("\nPhases:\n");
    for phase in PhaseType::ORDER {
        let status = map.phase_status(phase, None);
        let attempts = map.phase(phase, None).map(|p| p.attempts).unwrap_or(0);
        let _ = writeln!(
            out,
            "  {:<15} {:<17} attempts={}",
            phase.as_str(),
            status.to_string(),
            attempts
        );
        for (key, exec) in &map.phases {
            if exec.phase_type == phase && exec.epic_id.is_some() {
                let _ = writeln!(out, "    {key:<28} {}", exec.status);
            }
        }
    }

    if !map.epics().is_empty() {
        out.push_str("\nEpics:\n");
        for epic in map.epics() {
            let _ = writeln!(
                out,
                "  {} [{}] {} ${:.2}",
                epic.epic_id, epic.status, epic.title, epic.cost
            );
            for story in epic.stories() {
                let _ = writeln!(
                    out,
                    "    {} [{} / {}] {}{}",
                    story.story_id,
                    story.status,
                    story.progress_stage,
                    story.assigned_to.as_deref().unwrap_or("unassigned"),
                    story
                        .last_commit_hash
                        .as_deref()
                        .map(|h| format!(" @{}", h.chars().take(8).collect::<String>()))
                        .unwrap_or_default()
                );
            }
        }
    }

    let open: Vec<_> = map.detailed_errors.iter().filter(|e| !e.resolved).collect();
    if !open.is_empty() {
        out.push_str("\nOpen errors:\n");
        for err in open {
            let _ = writeln!(
                out,
                "  [{}] {} ({}): {}",
                err.phase,
                err.error_code,
                err.severity,
                err.message.lines().next().unwrap_or_default()
            );
        }
    }

    out
}
