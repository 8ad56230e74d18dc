//! Per-role prompt and sampling settings

use aidev_core::domain::provider::Role;
use serde::{Deserialize, Serialize};

use crate::provider::{ChatMessage, CompletionRequest};

const ACK: &str = "Understood. I have read the context and am ready for the task.";

/// System prompt and sampling parameters for one role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleProfile {
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl RoleProfile {
    /// Built-in settings for `role`
    pub fn default_for(role: Role) -> Self {
        match role {
            Role::Planner => Self {
                system_prompt: "You are a senior engineer. Read the issue and the project \
                    context, then write a short numbered plan naming the files to change \
                    and why. Do not write code."
                    .to_string(),
                max_tokens: 2048,
                temperature: 0.3,
                top_p: 0.9,
            },
            Role::Architect => Self {
                system_prompt: "You are a software architect. Produce a concise \
                    implementation plan for the issue: affected files, approach and risks."
                    .to_string(),
                max_tokens: 2048,
                temperature: 0.3,
                top_p: 0.9,
            },
            Role::Coder => Self {
                system_prompt: "You are an expert programmer. Implement the plan. For every \
                    file you change output the complete new contents between \
                    '=== FILE: <relative path> ===' and '=== END FILE ===' lines. \
                    Output nothing else."
                    .to_string(),
                max_tokens: 8192,
                temperature: 0.1,
                top_p: 0.95,
            },
            Role::Reviewer => Self {
                system_prompt: "You are a code reviewer. Point out destructive database \
                    statements, hard-coded credentials, unsafe shell usage and syntax the \
                    target runtime does not support. Answer 'OK' if you find none."
                    .to_string(),
                max_tokens: 1024,
                temperature: 0.0,
                top_p: 1.0,
            },
        }
    }
}

/// What a caller asks of a role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeRequest {
    pub task: String,
    /// Project or issue context given ahead of the task
    pub context: Option<String>,
}

impl InvokeRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Lays out the conversation sent to the provider
    ///
    /// System prompt, then the context as a user turn followed by a short
    /// assistant acknowledgement, then the task as the final user turn.
    pub fn to_completion(&self, profile: &RoleProfile) -> CompletionRequest {
        let mut messages = vec![ChatMessage::system(&profile.system_prompt)];
        if let Some(context) = self.context.as_deref().filter(|c| !c.trim().is_empty()) {
            messages.push(ChatMessage::user(context));
            messages.push(ChatMessage::assistant(ACK));
        }
        messages.push(ChatMessage::user(&self.task));

        CompletionRequest {
            messages,
            max_tokens: profile.max_tokens,
            temperature: profile.temperature,
            top_p: profile.top_p,
        }
    }
}
