//! `{placeholder}` substitution for process argument templates.

use crate::error::GrimoireError;
use std::collections::HashMap;

/// Values available to an argument template.
#[derive(Debug, Default, Clone)]
pub struct TemplateVars {
    values: HashMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Render every argument of `template`.
pub fn render_args(template: &[String], vars: &TemplateVars) -> Result<Vec<String>, GrimoireError> {
    template.iter().map(|arg| render_arg(arg, vars)).collect()
}

/// Replace each `{name}` in `arg` with its value. Braces that do not wrap an
/// identifier are copied as-is; an identifier without a value is an error.
pub fn render_arg(arg: &str, vars: &TemplateVars) -> Result<String, GrimoireError> {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let placeholder = after
            .find('}')
            .map(|close| &after[..close])
            .filter(|name| is_identifier(name));

        match placeholder {
            Some(name) => {
                let value = vars.get(name).ok_or_else(|| {
                    GrimoireError::configuration(format!(
                        "unresolved placeholder '{{{name}}}' in argument '{arg}'"
                    ))
                })?;
                out.push_str(value);
                rest = &after[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    Ok(out)
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
