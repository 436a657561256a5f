//! Declarative launch templates.
//!
//! Every external process Fleet starts (sub-agents, the batch task executor)
//! is described by a [`LaunchTemplate`] instead of per-integration code.
//! Arguments and environment values may contain `{name}` placeholders that
//! are substituted at launch time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How to start one kind of external process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchTemplate {
    /// Program to execute (looked up on `PATH` when not absolute).
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Whether the child reads its initial context from stdin.
    #[serde(default)]
    pub stdin: bool,
    /// Working directory for the child.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl LaunchTemplate {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            env: BTreeMap::new(),
            stdin: false,
            cwd: None,
        }
    }

    /// Arguments with placeholders substituted.
    pub fn render_args(&self, vars: &BTreeMap<&str, String>) -> Vec<String> {
        self.args.iter().map(|a| substitute(a, vars)).collect()
    }

    /// Environment with placeholders substituted.
    pub fn render_env(&self, vars: &BTreeMap<&str, String>) -> BTreeMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, vars)))
            .collect()
    }
}

/// Replace `{key}` occurrences with values from `vars`. Unknown keys are kept verbatim.
pub fn substitute(input: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match vars.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        vars.insert("role", "coder".to_string());
        vars.insert("tenant", "acme".to_string());
        vars
    }

    #[test]
    fn substitutes_known_placeholders() {
        assert_eq!(substitute("--role={role}/{tenant}", &vars()), "--role=coder/acme");
    }

    #[test]
    fn keeps_unknown_and_unterminated_placeholders() {
        assert_eq!(substitute("{missing} {role", &vars()), "{missing} {role");
    }

    #[test]
    fn renders_args_and_env() {
        let mut template = LaunchTemplate::new("agent", &["--as", "{role}"]);
        template
            .env
            .insert("WORKSPACE".to_string(), "/srv/{tenant}".to_string());
        assert_eq!(template.render_args(&vars()), vec!["--as", "coder"]);
        assert_eq!(template.render_env(&vars())["WORKSPACE"], "/srv/acme");
    }
}
