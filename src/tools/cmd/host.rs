use async_trait::async_trait;
use tokio::process::Command;

use super::executor::{run_to_completion, ExecSpec, ProcessExecutor, ProcessOutcome};
use super::CommandError;

/// Install hints returned when a runtime is missing from the host `PATH`.
const COMMAND_NOT_FOUND_HINTS: &[(&str, &str)] = &[
    ("npm", "npm not found. Install Node.js from https://nodejs.org to run JavaScript/Node projects."),
    ("npx", "npx not found. Install Node.js from https://nodejs.org."),
    ("node", "node not found. Install Node.js from https://nodejs.org for JavaScript/Node projects."),
    ("yarn", "yarn not found. Install Node.js and optionally run: npm install -g yarn"),
    ("bun", "bun not found. Install Bun from https://bun.sh or use npm instead."),
    ("pnpm", "pnpm not found. Install Node.js and optionally run: npm install -g pnpm"),
    ("java", "java not found. Install a JDK (e.g. OpenJDK or Adoptium) for Java projects."),
    ("javac", "javac not found. Install a JDK (e.g. OpenJDK or Adoptium) for Java projects."),
    ("mvn", "mvn not found. Install Maven (https://maven.apache.org) or use the Maven Wrapper (mvnw) in the project."),
    ("gradle", "gradle not found. Install Gradle (https://gradle.org) or use the Gradle Wrapper (gradlew) in the project."),
    ("go", "go not found. Install Go from https://go.dev"),
    ("cargo", "cargo not found. Install Rust from https://rustup.rs"),
    ("rustc", "rustc not found. Install Rust from https://rustup.rs"),
    ("dotnet", "dotnet not found. Install .NET SDK from https://dotnet.microsoft.com"),
    ("ruby", "ruby not found. Install Ruby from https://www.ruby-lang.org or use rbenv/asdf."),
    ("gem", "gem not found. Install Ruby (includes gem) from https://www.ruby-lang.org"),
    ("bundle", "bundle not found. Install Ruby and run: gem install bundler"),
    ("php", "php not found. Install PHP from https://www.php.net"),
    ("composer", "composer not found. Install PHP and Composer from https://getcomposer.org"),
    ("swift", "swift not found. Install Swift from https://swift.org"),
    ("swiftc", "swiftc not found. Install Swift from https://swift.org"),
    ("gcc", "gcc not found. Install GCC (e.g. build-essential on Ubuntu or Xcode CLI on macOS)."),
    ("g++", "g++ not found. Install G++ (e.g. build-essential on Ubuntu or Xcode CLI on macOS)."),
    ("make", "make not found. Install Make (e.g. build-essential on Ubuntu or Xcode on macOS)."),
    ("cmake", "cmake not found. Install CMake from https://cmake.org"),
    ("sbt", "sbt not found. Install sbt from https://www.scala-sbt.org"),
    ("mix", "mix not found. Install Elixir from https://elixir-lang.org"),
    ("cabal", "cabal not found. Install Haskell GHC and Cabal from https://www.haskell.org"),
    ("ghc", "ghc not found. Install Haskell GHC from https://www.haskell.org"),
];

pub fn not_found_hint(program: &str) -> String {
    COMMAND_NOT_FOUND_HINTS
        .iter()
        .find(|(name, _)| *name == program)
        .map(|(_, hint)| hint.to_string())
        .unwrap_or_else(|| {
            format!(
                "Command '{program}' not found. Install the required runtime and ensure it is on PATH."
            )
        })
}

/// Runs programs directly on the host inside the workspace directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostExecutor;

#[async_trait]
impl ProcessExecutor for HostExecutor {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn execute(&self, spec: &ExecSpec) -> Result<ProcessOutcome, CommandError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            // Project code inside the workspace picks its own settings module.
            .env_remove("DJANGO_SETTINGS_MODULE");

        match run_to_completion(command, spec.timeout, spec.max_output_bytes).await {
            Ok(outcome) => Ok(outcome),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(program = %spec.program, "program not found on host");
                Ok(ProcessOutcome::not_found(not_found_hint(&spec.program)))
            }
            Err(source) => Err(CommandError::Spawn {
                program: spec.program.clone(),
                source,
            }),
        }
    }
}
