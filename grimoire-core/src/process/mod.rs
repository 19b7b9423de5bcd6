//! Local inference processes.
//!
//! A local model is a binary invoked once per request: the prompt and
//! sampling parameters go in through an argument template, the reply comes
//! back on stdout after a delimiter.

mod output;
mod runner;
mod template;

pub use output::{extract_reply, LineTail};
pub use runner::LocalProcessRunner;
pub use template::{render_arg, render_args, TemplateVars};

use crate::types::ChatMessage;

/// Render a transcript as `role: content` lines, ending with an open
/// `assistant:` turn for the model to complete.
pub fn render_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(message.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(message.content.trim());
        prompt.push('\n');
    }
    prompt.push_str("assistant:");
    prompt
}
