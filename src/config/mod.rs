//! Configuration module: prompt templates.

mod prompts;

pub use prompts::{
    advisory_prompt, content_generation_prompt, markers, observation_prompt, planning_prompt,
    reflection_prompt, thought_prompt, SYSTEM_PROMPT,
};
