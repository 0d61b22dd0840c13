//! Prompt templates for planning, the reasoning phases and escalation.
//!
//! Every template names the JSON shape it expects back. Call sites never
//! trust that shape; see the defaults in `agent::reasoning` and
//! `agent::planner`.

/// Phase markers embedded in prompts, one per call site.
pub mod markers {
    pub const PLAN: &str = "[PHASE:PLAN]";
    pub const THOUGHT: &str = "[PHASE:THOUGHT]";
    pub const OBSERVATION: &str = "[PHASE:OBSERVATION]";
    pub const REFLECTION: &str = "[PHASE:REFLECTION]";
    pub const ADVISORY: &str = "[PHASE:ADVISORY]";
    pub const GENERATE: &str = "[PHASE:GENERATE]";
}

/// Default system prompt for the model client.
pub const SYSTEM_PROMPT: &str = "You are the reasoning core of an autonomous task execution engine \
working inside a software workspace. Be precise and concise. When a response format is requested, \
answer with a single JSON object and nothing else.";

const ACTION_KINDS_HELP: &str = r#"Available action types and their params:
- read_resource      {"path": "relative/or/absolute/path"}
- write_resource     {"path": "...", "content": "..."}
- delete_resource    {"path": "..."}
- search             {"query": "text or file name", "path": "optional sub directory"}
- generate_content   {"prompt": "what to generate", "language": "optional"}
- run_command        {"command": "shell command"}
- request_user_input {"prompt": "question for the user"}
- custom             {any params}"#;

/// Prompt asking the model for an ordered plan.
pub fn planning_prompt(request: &str, workspace: &str, history: &str) -> String {
    format!(
        r#"{marker}
Break the user's request into an ordered list of concrete steps.

## User request
{request}

## Workspace
{workspace}

## Prior similar tasks
{history}

{kinds}

## Response format
Respond with JSON only:
{{"steps": [{{"title": "short title", "description": "what and why", "action": {{"type": "read_resource", "params": {{"path": "..."}}}}, "critical": false}}]}}

Mark a step "critical": true only if the whole task is meaningless when it fails.
Keep the plan minimal; prefer reading before writing."#,
        marker = markers::PLAN,
        kinds = ACTION_KINDS_HELP,
    )
}

/// Prompt for the Thought phase.
pub fn thought_prompt(
    goal: &str,
    step: &str,
    action: &str,
    confidence: &str,
    previous_attempts: &str,
) -> String {
    format!(
        r#"{marker}
You are about to execute one step of a larger task.

Task goal: {goal}
Step: {step}
Planned action: {action}
Confidence: {confidence}

## Previous failed attempts
{previous_attempts}

State your approach. Respond with JSON only:
{{"reasoning": "...", "chosen_approach": "...", "alternatives": ["..."], "risk_notes": ["..."], "expected_outcome": "..."}}"#,
        marker = markers::THOUGHT,
    )
}

/// Prompt for the Observation phase.
pub fn observation_prompt(expected: &str, action: &str, success: bool, actual: &str) -> String {
    format!(
        r#"{marker}
Compare what was expected with what happened.

Action: {action}
Expected outcome: {expected}
Handler reported success: {success}
Actual outcome: {actual}

Respond with JSON only:
{{"actual_outcome": "...", "differences": ["..."], "unexpected_events": ["..."]}}"#,
        marker = markers::OBSERVATION,
    )
}

/// Prompt for the Reflection phase.
pub fn reflection_prompt(thought: &str, observation: &str, attempts_left: u32) -> String {
    format!(
        r#"{marker}
Reflect on this attempt.

## Thought
{thought}

## Observation
{observation}

Retries left: {attempts_left}

{kinds}

Respond with JSON only:
{{"what_worked": ["..."], "what_failed": ["..."], "root_cause": "... or null", "should_retry": true, "suggested_changes": ["..."], "knowledge_gained": ["..."], "alternative_action": {{"type": "search", "params": {{"query": "..."}}}} }}

Set "alternative_action" to null unless you can name one concrete replacement action."#,
        marker = markers::REFLECTION,
        kinds = ACTION_KINDS_HELP,
    )
}

/// Prompt asking an advisor for help with a stuck task.
pub fn advisory_prompt(
    goal: &str,
    pattern: &str,
    step: &str,
    recent_failures: &str,
    attempted: &str,
) -> String {
    format!(
        r#"{marker}
An autonomous task is stuck and needs a second opinion.

Task goal: {goal}
Detected pattern: {pattern}
Current step: {step}

## Recent failures
{recent_failures}

## Approaches already attempted
{attempted}

{kinds}

Respond with JSON only:
{{"diagnosis": "...", "suggested_approach": "...", "alternative_strategies": ["..."], "should_continue": true, "alternative_action": null}}"#,
        marker = markers::ADVISORY,
        kinds = ACTION_KINDS_HELP,
    )
}

/// Prompt for the generate-content action.
pub fn content_generation_prompt(instructions: &str, language: Option<&str>) -> String {
    let language_line = language
        .map(|l| format!("Target language: {}\n", l))
        .unwrap_or_default();
    format!(
        "{marker}\n{language_line}Produce only the requested content, without commentary or code fences.\n\n{instructions}",
        marker = markers::GENERATE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_carry_markers() {
        assert!(planning_prompt("do it", "", "").starts_with(markers::PLAN));
        assert!(thought_prompt("g", "s", "a", "c", "p").starts_with(markers::THOUGHT));
        assert!(observation_prompt("e", "a", true, "x").starts_with(markers::OBSERVATION));
        assert!(reflection_prompt("t", "o", 2).starts_with(markers::REFLECTION));
        assert!(advisory_prompt("g", "p", "s", "f", "a").starts_with(markers::ADVISORY));
        assert!(content_generation_prompt("x", None).starts_with(markers::GENERATE));
    }

    #[test]
    fn test_planning_prompt_is_deterministic() {
        assert_eq!(
            planning_prompt("Read README.md", "files: 3", "none"),
            planning_prompt("Read README.md", "files: 3", "none")
        );
    }
}
