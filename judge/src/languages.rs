//! Language toolchain adapters
//!
//! Translates a language tag into compile and run steps. Nothing here runs a
//! process; the judge pipeline hands the steps to a sandbox.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::core::{LimitOverride, TestCase};
use crate::sandbox::{CommandSpec, ExecutionLimits};

#[derive(Debug, Error)]
pub enum LanguageError {
    #[error("unsupported language: {0}")]
    Unsupported(String),
    #[error("invalid language table: {0}")]
    InvalidTable(String),
    #[error("failed to parse language table")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    /// Canonical language name
    pub name: String,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// Compile command (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command template
    pub run_command: Vec<String>,
    /// Default time limit when a case declares none
    pub time_limit_ms: Option<u32>,
    /// Default memory limit when a case declares none
    pub memory_limit_mb: Option<u32>,
    /// (multiplier, bonus_ms) applied to problem time limits
    pub time_scale: Option<(u32, u32)>,
    /// (multiplier, bonus_mb) applied to problem memory limits
    pub memory_scale: Option<(u32, u32)>,
    /// Enforce the memory ceiling as an address-space rlimit as well
    pub address_space_limit: bool,
}

impl LanguageConfig {
    /// Calculate actual time limit based on a problem time limit
    pub fn calculate_time_limit(&self, base_time_ms: u32) -> u32 {
        match self.time_scale {
            Some((multiplier, bonus_ms)) => base_time_ms
                .saturating_mul(multiplier)
                .saturating_add(bonus_ms),
            None => base_time_ms,
        }
    }

    /// Calculate actual memory limit based on a problem memory limit
    pub fn calculate_memory_limit(&self, base_memory_mb: u32) -> u32 {
        match self.memory_scale {
            Some((multiplier, bonus_mb)) => base_memory_mb
                .saturating_mul(multiplier)
                .saturating_add(bonus_mb),
            None => base_memory_mb,
        }
    }

    /// Compile step, if the language has one
    pub fn compile_step(&self) -> Option<CommandSpec> {
        self.compile_command
            .as_ref()
            .filter(|cmd| !cmd.is_empty())
            .map(|cmd| CommandSpec::from_vec(cmd))
    }

    /// Run step with `{memory_mb}` resolved against the given limits
    pub fn run_step(&self, limits: &ExecutionLimits) -> CommandSpec {
        let memory = limits.memory_mb.to_string();
        let rendered: Vec<String> = self
            .run_command
            .iter()
            .map(|part| part.replace("{memory_mb}", &memory))
            .collect();
        CommandSpec::from_vec(&rendered)
    }

    /// Resolve the limits for one test case.
    ///
    /// Problem-declared limits are scaled for the language; a request override
    /// can only lower the result, and everything is capped by the ceilings.
    pub fn limits_for(
        &self,
        case: &TestCase,
        request: &LimitOverride,
        config: &EngineConfig,
    ) -> ExecutionLimits {
        let time_ms = match case.time_limit_ms {
            Some(t) => self.calculate_time_limit(t),
            None => self.time_limit_ms.unwrap_or(config.run_time_ms),
        };
        let time_ms = request.time_ms.map_or(time_ms, |r| r.min(time_ms));
        let time_ms = config.cap_run_time(time_ms);

        let memory_mb = match case.memory_limit_mb {
            Some(m) => self.calculate_memory_limit(m),
            None => self.memory_limit_mb.unwrap_or(config.memory_mb),
        };
        let memory_mb = request.memory_mb.map_or(memory_mb, |r| r.min(memory_mb));
        let memory_mb = config.cap_memory(memory_mb);

        ExecutionLimits {
            cpu_time_ms: time_ms,
            wall_time_ms: config.wall_time_for(time_ms),
            memory_mb,
            output_cap_bytes: config.output_cap_for(request),
            address_space_limit: self.address_space_limit,
        }
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    time_limit_ms: Option<u32>,
    #[serde(default)]
    memory_limit_mb: Option<u32>,
    #[serde(default)]
    time_scale: Vec<u32>,
    #[serde(default)]
    memory_scale: Vec<u32>,
    #[serde(default = "default_true")]
    address_space_limit: bool,
    #[serde(default)]
    aliases: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Lookup table from language tag (and aliases) to adapter
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, Arc<LanguageConfig>>,
    names: Vec<String>,
}

impl LanguageRegistry {
    /// Registry built from the embedded language table
    pub fn builtin() -> Result<Self, LanguageError> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml_str(content)
    }

    /// Load `JUDGE_LANGUAGES` if set, otherwise the embedded table
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var("JUDGE_LANGUAGES") {
            Ok(path) => Self::from_file(&path),
            Err(_) => Ok(Self::builtin()?),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language table {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid language table {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, LanguageError> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut registry = LanguageRegistry::default();

        for (name, raw) in raw_configs {
            let parse_scale = |raw_scale: Vec<u32>, kind: &str| {
                match raw_scale.len() {
                    0 => Ok(None),
                    2 => Ok(Some((raw_scale[0], raw_scale[1]))),
                    _ => Err(LanguageError::InvalidTable(format!(
                        "{} scale for {} must be [multiplier, bonus], got {:?}",
                        kind, name, raw_scale
                    ))),
                }
            };

            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                return Err(LanguageError::InvalidTable(format!(
                    "empty run_command for {}",
                    name
                )));
            }

            let config = Arc::new(LanguageConfig {
                name: name.to_lowercase(),
                source_file: raw.source_file,
                compile_command: raw.compile_command.map(|cmd| into_command(&cmd)),
                run_command,
                time_limit_ms: raw.time_limit_ms,
                memory_limit_mb: raw.memory_limit_mb,
                time_scale: parse_scale(raw.time_scale, "time")?,
                memory_scale: parse_scale(raw.memory_scale, "memory")?,
                address_space_limit: raw.address_space_limit,
            });

            registry.names.push(config.name.clone());
            registry
                .languages
                .insert(config.name.clone(), Arc::clone(&config));

            for alias in raw.aliases {
                registry
                    .languages
                    .insert(alias.to_lowercase(), Arc::clone(&config));
            }
        }

        registry.names.sort();
        Ok(registry)
    }

    /// Get language configuration by tag or alias
    pub fn get(&self, language: &str) -> Result<Arc<LanguageConfig>, LanguageError> {
        self.languages
            .get(&language.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| LanguageError::Unsupported(language.to_string()))
    }

    /// Canonical names of all supported languages
    pub fn supported(&self) -> &[String] {
        &self.names
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
[c]
source_file = "main.c"
compile_command = "gcc -o main main.c"
run_command = "./main"

[python]
source_file = "main.py"
run_command = "python3 main.py"
aliases = ["py", "python3"]
time_scale = [3, 2000]
memory_scale = [2, 32]
"#;

    #[test]
    fn test_load_languages() {
        let registry = LanguageRegistry::from_toml_str(TABLE).unwrap();
        assert_eq!(registry.supported(), &["c".to_string(), "python".to_string()]);
        assert_eq!(registry.get("PY").unwrap().name, "python");
        assert!(registry.get("python").unwrap().compile_step().is_none());
        assert_eq!(
            registry.get("c").unwrap().compile_step().unwrap().to_vec(),
            vec!["gcc", "-o", "main", "main.c"]
        );
    }

    #[test]
    fn test_unsupported_language() {
        let registry = LanguageRegistry::from_toml_str(TABLE).unwrap();
        assert!(matches!(
            registry.get("brainfuck"),
            Err(LanguageError::Unsupported(tag)) if tag == "brainfuck"
        ));
    }

    #[test]
    fn test_invalid_scale_rejected() {
        let table = r#"
[c]
source_file = "main.c"
run_command = "./main"
time_scale = [1, 2, 3]
"#;
        assert!(matches!(
            LanguageRegistry::from_toml_str(table),
            Err(LanguageError::InvalidTable(_))
        ));
    }

    #[test]
    fn test_builtin_table() {
        let registry = LanguageRegistry::builtin().unwrap();
        for tag in ["c", "cpp", "c++", "java", "py", "js", "rust", "sh"] {
            assert!(registry.get(tag).is_ok(), "missing {}", tag);
        }
        assert!(!registry.get("java").unwrap().address_space_limit);
    }

    #[test]
    fn test_limits_for_scales_and_clamps() {
        let registry = LanguageRegistry::from_toml_str(TABLE).unwrap();
        let python = registry.get("python").unwrap();
        let config = EngineConfig::default();

        let case = TestCase::new("", "").with_time_limit(1000).with_memory_limit(128);
        let limits = python.limits_for(&case, &LimitOverride::default(), &config);
        assert_eq!(limits.cpu_time_ms, 5000);
        assert_eq!(limits.memory_mb, 288);
        assert_eq!(limits.wall_time_ms, config.wall_time_for(5000));

        // request overrides only lower limits
        let request = LimitOverride {
            time_ms: Some(100_000),
            memory_mb: Some(64),
            output_cap_bytes: None,
        };
        let limits = python.limits_for(&case, &request, &config);
        assert_eq!(limits.cpu_time_ms, 5000);
        assert_eq!(limits.memory_mb, 64);

        // defaults come from the engine when neither case nor language sets one
        let limits = python.limits_for(&TestCase::new("", ""), &LimitOverride::default(), &config);
        assert_eq!(limits.cpu_time_ms, config.run_time_ms);

        // ceilings win over scaling
        let huge = TestCase::new("", "").with_time_limit(1_000_000);
        let limits = python.limits_for(&huge, &LimitOverride::default(), &config);
        assert_eq!(limits.cpu_time_ms, config.ceilings.run_time_ms);
    }

    #[test]
    fn test_run_step_renders_memory() {
        let registry = LanguageRegistry::builtin().unwrap();
        let java = registry.get("java").unwrap();
        let limits = ExecutionLimits {
            memory_mb: 300,
            ..ExecutionLimits::default()
        };
        assert!(java.run_step(&limits).args.contains(&"-Xmx300m".to_string()));
    }
}
