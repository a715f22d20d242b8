//! Prompt selection and rendering.
//!
//! Three regular roles rotate through the iteration loop: the initializer
//! (no feature list yet), the manager (every N iterations or on demand), and
//! the coding agent. QA and cleaner prompts are issued by the lifecycle
//! transitions only.

use recac_core::feature::FeatureList;
use recac_core::Observation;

/// Which prompt to issue this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Plan the specification into a feature list.
    Initializer,
    /// Implement the next feature(s).
    Coding,
    /// Review progress and unblock the team.
    Manager,
    /// Validate completed work.
    Qa,
    /// Tidy the workspace before termination.
    Cleaner,
}

/// Everything a prompt template can draw on.
pub struct PromptContext<'a> {
    /// The project specification text.
    pub spec: &'a str,
    /// Current feature list.
    pub features: &'a FeatureList,
    /// Recent history, newest first.
    pub history: &'a [Observation],
    /// Whether the stalled breaker crossed its warning threshold.
    pub stall_warning: bool,
    /// Feature id the session is focused on, if any.
    pub selected_task: Option<&'a str>,
}

/// Choose the prompt for a regular iteration.
pub fn select(
    has_features: bool,
    iteration: u32,
    manager_frequency: u32,
    manager_triggered: bool,
) -> PromptKind {
    if !has_features {
        PromptKind::Initializer
    } else if manager_triggered || (manager_frequency > 0 && iteration % manager_frequency == 0) {
        PromptKind::Manager
    } else {
        PromptKind::Coding
    }
}

/// Render the prompt text for a role.
pub fn render(kind: PromptKind, ctx: &PromptContext<'_>) -> String {
    match kind {
        PromptKind::Initializer => render_initializer(ctx),
        PromptKind::Coding => render_coding(ctx),
        PromptKind::Manager => render_manager(ctx),
        PromptKind::Qa => render_qa(ctx),
        PromptKind::Cleaner => render_cleaner(ctx),
    }
}

fn feature_summary(features: &FeatureList) -> String {
    if features.features.is_empty() {
        return "(no features planned yet)".to_string();
    }
    features
        .features
        .iter()
        .map(|f| {
            format!(
                "- {} [{}] passes={} : {}",
                f.id, f.status, f.passes, f.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn history_excerpt(history: &[Observation], limit: usize) -> String {
    if history.is_empty() {
        return "(no history yet)".to_string();
    }
    history
        .iter()
        .take(limit)
        .map(|o| format!("[{}] {}", o.role, o.content))
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn render_initializer(ctx: &PromptContext<'_>) -> String {
    format!(
        "You are the planning agent for an autonomous delivery run.\n\
         Read the specification and produce `feature_list.json` in the workspace:\n\
         a JSON document {{\"features\":[...]}} where each feature has id, category,\n\
         priority, description, status, passes, and dependencies (prerequisites,\n\
         exclusive_write_paths, read_only_paths). Keep features small and\n\
         independently verifiable. Emit shell commands in ```bash blocks.\n\n\
         SPECIFICATION:\n{}\n",
        ctx.spec
    )
}

fn render_coding(ctx: &PromptContext<'_>) -> String {
    let focus = match ctx.selected_task {
        Some(id) => format!(
            "You are assigned exactly one feature: `{id}`. Work only inside its\n\
             exclusive write paths and do not touch other features.\n"
        ),
        None => "Pick the highest-priority feature whose prerequisites pass.\n".to_string(),
    };
    format!(
        "You are a coding agent. Implement features from the list below, run the\n\
         project's tests, and update `feature_list.json` statuses as you go. Emit\n\
         every command in a ```bash block; the transcript of the previous commands\n\
         is in the history.\n\n{focus}\nFEATURES:\n{}\n\nRECENT HISTORY:\n{}\n\nSPECIFICATION:\n{}\n",
        feature_summary(ctx.features),
        history_excerpt(ctx.history, 5),
        ctx.spec
    )
}

fn render_manager(ctx: &PromptContext<'_>) -> String {
    let stall_note = if ctx.stall_warning {
        "\nWARNING: the passing-feature count has not moved for many iterations.\n\
         Diagnose the stall: reorder work, split features, or mark dead ends failed.\n"
    } else {
        ""
    };
    format!(
        "You are the engineering manager reviewing an autonomous delivery run.\n\
         Assess the feature list against the specification, re-prioritize, add\n\
         missing features, and remove busywork. If the project is genuinely ready\n\
         to ship, say so; if not, reply with NEEDS_WORK and concrete directions.\n\
         {stall_note}\nFEATURES:\n{}\n\nRECENT HISTORY:\n{}\n",
        feature_summary(ctx.features),
        history_excerpt(ctx.history, 10)
    )
}

fn render_qa(ctx: &PromptContext<'_>) -> String {
    format!(
        "You are the QA agent. Verify every feature marked done or implemented:\n\
         run the test suite and exercise the acceptance criteria from the\n\
         specification. Update `passes` per feature in `feature_list.json`.\n\
         Reply with REJECTED and the failing feature ids if anything does not\n\
         hold up.\n\nFEATURES:\n{}\n\nSPECIFICATION:\n{}\n",
        feature_summary(ctx.features),
        ctx.spec
    )
}

fn render_cleaner(_ctx: &PromptContext<'_>) -> String {
    "You are the cleanup agent. Remove scratch files, stray build artifacts, and\n\
     debugging leftovers from the workspace; make sure ignored files are not\n\
     tracked. Do not change behavior. Emit commands in ```bash blocks.\n"
        .to_string()
}

/// Markers a manager/QA reply uses to reject the current state.
pub fn detect_rejection(reply: &str) -> bool {
    const MARKERS: &[&str] = &["NEEDS_WORK", "REJECTED", "\"approved\":false", "\"approved\": false"];
    let upper = reply.to_uppercase();
    MARKERS.iter().any(|m| upper.contains(&m.to_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use recac_core::feature::Feature;

    #[test]
    fn test_select_initializer_without_features() {
        assert_eq!(select(false, 1, 10, false), PromptKind::Initializer);
    }

    #[test]
    fn test_select_manager_on_frequency() {
        assert_eq!(select(true, 10, 10, false), PromptKind::Manager);
        assert_eq!(select(true, 11, 10, false), PromptKind::Coding);
    }

    #[test]
    fn test_select_manager_on_trigger() {
        assert_eq!(select(true, 3, 10, true), PromptKind::Manager);
    }

    #[test]
    fn test_manager_prompt_includes_stall_warning() {
        let features = FeatureList {
            features: vec![Feature::new("a", "thing")],
        };
        let ctx = PromptContext {
            spec: "spec",
            features: &features,
            history: &[],
            stall_warning: true,
            selected_task: None,
        };
        let prompt = render(PromptKind::Manager, &ctx);
        assert!(prompt.contains("WARNING"));

        let calm = PromptContext {
            stall_warning: false,
            ..ctx
        };
        assert!(!render(PromptKind::Manager, &calm).contains("WARNING"));
    }

    #[test]
    fn test_coding_prompt_focuses_selected_task() {
        let features = FeatureList {
            features: vec![Feature::new("feat-auth", "login")],
        };
        let ctx = PromptContext {
            spec: "spec",
            features: &features,
            history: &[],
            stall_warning: false,
            selected_task: Some("feat-auth"),
        };
        let prompt = render(PromptKind::Coding, &ctx);
        assert!(prompt.contains("exactly one feature: `feat-auth`"));
    }

    #[test]
    fn test_detect_rejection_markers() {
        assert!(detect_rejection("Verdict: NEEDS_WORK on feat-2"));
        assert!(detect_rejection("{\"approved\": false}"));
        assert!(detect_rejection("rejected: missing tests"));
        assert!(!detect_rejection("Everything passes, ready to ship."));
    }
}
