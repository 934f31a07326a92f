use std::collections::HashSet;

use regex::Regex;

use super::PolicyDecision;

/// Runtime registry allowed out of the box: interpreters, compilers, package
/// managers, git, and a handful of read-only shell utilities.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    // Python
    "python", "python3", "pip", "pip3", "django-admin", "pytest", "ruff", "black", "mypy",
    // Node / JavaScript
    "node", "npm", "npx", "yarn", "bun", "pnpm",
    // JVM
    "java", "javac", "mvn", "mvnw", "gradle", "gradlew", "kotlinc", "kotlin", "scala",
    "scalac", "sbt",
    // Go
    "go",
    // Rust
    "cargo", "rustc",
    // .NET
    "dotnet",
    // Ruby
    "ruby", "gem", "bundle",
    // PHP
    "php", "composer",
    // Swift
    "swift", "swiftc",
    // C / C++
    "gcc", "g++", "make", "cmake",
    // Other runtimes
    "perl", "lua", "Rscript", "ghc", "cabal", "mix", "elixir",
    // Git and basic shell utilities
    "git", "ls", "pwd", "cat", "head", "tail", "mkdir", "echo", "sleep", "true", "false",
    "test",
];

/// Shell metacharacters refused anywhere in a command string.
pub const BLOCKED_SHELL_TOKENS: &[&str] = &["&&", "||", ";", ">", "<", "|", "&", "`", "$(", "${"];

/// Allow-list of spawnable programs: exact names plus anchored regex patterns.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    exact: HashSet<String>,
    patterns: Vec<Regex>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            exact: DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect(),
            patterns: Vec::new(),
        }
    }
}

impl CommandPolicy {
    /// Builds a policy from exact names and regex patterns. Patterns must match
    /// the whole program name.
    pub fn new<I, S>(exact: I, patterns: &[String]) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(&format!("^(?:{p})$")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            exact: exact.into_iter().map(Into::into).collect(),
            patterns,
        })
    }

    /// The default registry extended with operator-supplied entries.
    pub fn with_defaults(extra: &[String], patterns: &[String]) -> Result<Self, regex::Error> {
        let exact = DEFAULT_ALLOWED_COMMANDS
            .iter()
            .map(|s| s.to_string())
            .chain(extra.iter().cloned());
        Self::new(exact, patterns)
    }

    pub fn evaluate_command(&self, program: &str) -> PolicyDecision {
        let program = program.trim();
        if program.is_empty() {
            return PolicyDecision::Deny("command is empty".into());
        }
        if program.contains('/') || program.contains('\\') {
            return PolicyDecision::Deny(format!(
                "command must be a bare program name, got `{program}`"
            ));
        }

        if self.exact.contains(program) || self.patterns.iter().any(|re| re.is_match(program)) {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny(format!(
                "`{program}` is not on the allow-list. Add it to the allow-list if you trust it."
            ))
        }
    }
}

/// First blocked shell token found in `text`, if any.
pub fn blocked_shell_token(text: &str) -> Option<&'static str> {
    BLOCKED_SHELL_TOKENS
        .iter()
        .copied()
        .find(|token| text.contains(token))
}

/// Split a command line into words with POSIX shell quoting rules. No
/// expansion of any kind is performed.
pub fn split_command_line(line: &str) -> Result<Vec<String>, String> {
    shell_words::split(line).map_err(|e| format!("{e} in `{line}`"))
}
