//! Prompt templates for the default phase bodies.
//!
//! The wording is deliberately plain: each prompt states the task, the
//! context the agent needs, and the exact output format the phase body
//! parses. Retry feedback is appended as its own section.

use anvil_common::{EpicExecution, StoryExecution};

fn push_feedback(prompt: &mut String, feedback: Option<&str>) {
    if let Some(feedback) = feedback {
        prompt.push_str("## Previous Attempt\n\n");
        prompt.push_str(feedback);
        prompt.push_str("\n\nFix these problems in this attempt.\n\n");
    }
}

pub fn build_planning_prompt(description: &str, feedback: Option<&str>) -> String {
    let mut prompt = String::new();
    prompt.push_str("# Planning\n\n");
    prompt.push_str(
        "Analyze the request below. Describe the goal, the constraints, the \
         repositories involved and the main risks. Do not write code.\n\n",
    );
    prompt.push_str("## Request\n\n");
    prompt.push_str(description);
    prompt.push_str("\n\n");
    push_feedback(&mut prompt, feedback);
    prompt
}

pub fn build_architecture_prompt(
    description: &str,
    analysis: Option<&str>,
    feedback: Option<&str>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("# Architecture\n\n");
    prompt.push_str(
        "Split the request into epics (one per target repository) and stories \
         (the smallest unit one developer can finish alone).\n\n",
    );
    prompt.push_str("## Request\n\n");
    prompt.push_str(description);
    prompt.push_str("\n\n");

    if let Some(analysis) = analysis {
        prompt.push_str("## Analysis\n\n");
        prompt.push_str(analysis);
        prompt.push_str("\n\n");
    }

    prompt.push_str("## Rules\n\n");
    prompt.push_str("- Every story lists the files it will touch.\n");
    prompt.push_str("- No file may appear in more than one story.\n");
    prompt.push_str("- Each worker is assigned at most one story.\n\n");

    prompt.push_str("## Output\n\n");
    prompt.push_str("Reply with a single JSON object and nothing else:\n\n");
    prompt.push_str(
        "```json\n\
         {\n  \
           \"team\": [{\"worker_id\": \"dev-1\", \"role\": \"backend\"}],\n  \
           \"epics\": [{\n    \
             \"id\": \"api\", \"title\": \"...\", \"repository\": \"org/api\",\n    \
             \"stories\": [{\"id\": \"s1\", \"title\": \"...\", \"files\": [\"src/x.rs\"], \"assigned_to\": \"dev-1\"}]\n  \
           }]\n\
         }\n\
         ```\n\n",
    );
    push_feedback(&mut prompt, feedback);
    prompt
}

pub fn build_story_prompt(description: &str, epic: &EpicExecution, story: &StoryExecution) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Story {}: {}\n\n", story.story_id, story.title));
    prompt.push_str(&format!(
        "You are implementing one story of epic `{}` ({}).\n\n",
        epic.epic_id, epic.title
    ));
    prompt.push_str("## Overall Request\n\n");
    prompt.push_str(description);
    prompt.push_str("\n\n");

    if !story.files.is_empty() {
        prompt.push_str("## Files\n\n");
        prompt.push_str("Only change these files:\n\n");
        for file in &story.files {
            prompt.push_str(&format!("- `{file}`\n"));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "Write the code and its tests in the working directory. Do not commit; \
         committing is handled for you.\n",
    );
    prompt
}

pub fn build_judge_prompt(epic: &EpicExecution, story: &StoryExecution) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Review: story {}\n\n", story.story_id));
    prompt.push_str(&format!(
        "Review the change made for story \"{}\" of epic `{}`.\n\n",
        story.title, epic.epic_id
    ));
    if let Some(hash) = &story.last_commit_hash {
        prompt.push_str(&format!("- **Commit**: `{hash}`\n"));
    }
    if let Some(files) = &story.files_modified {
        prompt.push_str(&format!("- **Files**: {}\n", files.join(", ")));
    }
    prompt.push('\n');
    prompt.push_str("## Output\n\n");
    prompt.push_str(
        "Explain your findings, then end with exactly one line:\n\n\
         `VERDICT: APPROVED` or `VERDICT: REJECTED`\n",
    );
    prompt
}

pub fn build_integration_prompt(
    description: &str,
    epics: &[EpicExecution],
    feedback: Option<&str>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("# Integration\n\n");
    prompt.push_str(
        "Open one pull request per epic branch against its repository's default \
         branch.\n\n",
    );
    prompt.push_str("## Request\n\n");
    prompt.push_str(description);
    prompt.push_str("\n\n## Epics\n\n");
    for epic in epics {
        prompt.push_str(&format!(
            "- `{}` ({}): branch `{}`, repository {}\n",
            epic.epic_id,
            epic.title,
            super::epic_branch(epic),
            epic.target_repository.as_deref().unwrap_or("(local)")
        ));
    }
    prompt.push_str("\n## Output\n\n");
    prompt.push_str("For each pull request, one line: `<epic id>: <pull request url>`\n\n");
    push_feedback(&mut prompt, feedback);
    prompt
}
