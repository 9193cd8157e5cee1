//! Tool catalog configuration
//!
//! Loads the set of runnable tools, their command templates and the prompt
//! patterns from a TOML file, falling back to built-in defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Placeholder substituted with the quoted target in command templates
pub const TARGET_PLACEHOLDER: &str = "{target}";

/// Default per-message character limit of the chat transport
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 4000;

/// Default shell used to run assembled commands
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors raised while assembling a command line for a target
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("target cannot be empty")]
    EmptyTarget,
    #[error("target cannot be quoted for the shell: {0}")]
    Unquotable(String),
}

/// A runnable external tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    /// Identifier used by callers to select the tool
    pub name: String,
    /// Human-readable name used in replies
    pub label: String,
    /// Command template, must contain `{target}`
    pub template: String,
    /// Extra prompt patterns specific to this tool
    #[serde(default)]
    pub prompt_patterns: Vec<String>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            template: template.into(),
            prompt_patterns: Vec::new(),
        }
    }

    /// Assemble the command line for `target`.
    ///
    /// The target is quoted as a single POSIX shell word before it is
    /// substituted, so it can never inject additional shell syntax.
    pub fn command_for(&self, target: &str) -> Result<String, CommandError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(CommandError::EmptyTarget);
        }
        let quoted =
            shlex::try_quote(target).map_err(|e| CommandError::Unquotable(e.to_string()))?;
        Ok(self.template.replace(TARGET_PLACEHOLDER, &quoted))
    }
}

/// Bot configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotConfig {
    /// Shell used as `<shell> -c <command>`
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Maximum characters per outbound message
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// Prompt patterns applied to every tool
    #[serde(default = "default_prompt_patterns")]
    pub prompt_patterns: Vec<String>,
    /// Known tools
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolSpec>,
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

fn default_max_message_chars() -> usize {
    DEFAULT_MAX_MESSAGE_CHARS
}

fn default_prompt_patterns() -> Vec<String> {
    ["(y)es (n)o", "[Y/n]", "[y/N]", "(y/n)"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new("nikto", "Nikto", "nikto -h {target}"),
        ToolSpec::new("sqlmap", "SQLMap", "sqlmap -u {target}"),
    ]
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            max_message_chars: default_max_message_chars(),
            prompt_patterns: default_prompt_patterns(),
            tools: default_tools(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file, or the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BotConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the session core relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shell.trim().is_empty() {
            return Err(ConfigError::Invalid("shell cannot be empty".to_string()));
        }
        if self.max_message_chars == 0 {
            return Err(ConfigError::Invalid(
                "max_message_chars must be greater than zero".to_string(),
            ));
        }
        if self.prompt_patterns.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::Invalid(
                "prompt patterns cannot be empty".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for tool in &self.tools {
            if tool.name.is_empty() {
                return Err(ConfigError::Invalid("tool name cannot be empty".to_string()));
            }
            if !names.insert(tool.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
            if !tool.template.contains(TARGET_PLACEHOLDER) {
                return Err(ConfigError::Invalid(format!(
                    "template for tool {} must contain {}",
                    tool.name, TARGET_PLACEHOLDER
                )));
            }
            if tool.prompt_patterns.iter().any(|p| p.is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "tool {} has an empty prompt pattern",
                    tool.name
                )));
            }
        }

        Ok(())
    }

    /// Get a tool by name
    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Prompt patterns in effect for a tool: the global set plus its own
    pub fn patterns_for(&self, tool: &ToolSpec) -> Vec<String> {
        self.prompt_patterns
            .iter()
            .chain(tool.prompt_patterns.iter())
            .cloned()
            .collect()
    }
}
