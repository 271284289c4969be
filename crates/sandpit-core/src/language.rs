//! Language descriptors and the registry that resolves them by id

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::SandpitError;

/// Name of the language whose payload is a bundled project.
pub const PROJECT_LANGUAGE_NAME: &str = "Multi-file program";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageDescriptor {
    pub id: u32,
    pub name: String,
    /// File the single-source payload is written to. Empty for bundles.
    #[serde(default)]
    pub source_file: String,
    /// May contain a `%s` placeholder for compiler options.
    #[serde(default)]
    pub compile_cmd: Option<String>,
    pub run_cmd: String,
    /// Seconds; falls back to the system default when absent.
    #[serde(default)]
    pub default_time_limit: Option<f64>,
    /// Kilobytes; falls back to the system default when absent.
    #[serde(default)]
    pub default_memory_limit: Option<u64>,
    #[serde(default)]
    pub is_archived: bool,
}

impl LanguageDescriptor {
    pub fn supports_compilation(&self) -> bool {
        self.compile_cmd
            .as_deref()
            .map(|cmd| !cmd.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn is_project(&self) -> bool {
        self.name == PROJECT_LANGUAGE_NAME
    }

    pub fn validate(&self) -> Result<(), SandpitError> {
        if self.name.trim().is_empty() {
            return Err(SandpitError::Config(format!(
                "language {} has an empty name",
                self.id
            )));
        }
        if self.run_cmd.trim().is_empty() {
            return Err(SandpitError::Config(format!(
                "language '{}' has an empty run_cmd",
                self.name
            )));
        }
        if !self.is_project() {
            let file = self.source_file.trim();
            if file.is_empty() || file.contains('/') || file.starts_with('.') {
                return Err(SandpitError::Config(format!(
                    "language '{}' needs a plain source_file name, got '{}'",
                    self.name, self.source_file
                )));
            }
        }
        Ok(())
    }
}

pub trait LanguageRegistry: Send + Sync {
    /// Resolve an active language. Unknown and archived ids are unsupported.
    fn resolve(&self, id: u32) -> Result<LanguageDescriptor, SandpitError>;

    fn list(&self) -> Vec<LanguageDescriptor>;
}

pub struct StaticLanguageRegistry {
    languages: BTreeMap<u32, LanguageDescriptor>,
}

impl StaticLanguageRegistry {
    pub fn new(languages: Vec<LanguageDescriptor>) -> Self {
        Self {
            languages: languages.into_iter().map(|l| (l.id, l)).collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_languages())
    }
}

impl Default for StaticLanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl LanguageRegistry for StaticLanguageRegistry {
    fn resolve(&self, id: u32) -> Result<LanguageDescriptor, SandpitError> {
        match self.languages.get(&id) {
            Some(language) if !language.is_archived => Ok(language.clone()),
            Some(language) => Err(SandpitError::UnsupportedLanguage(format!(
                "{} (id {}) is archived",
                language.name, id
            ))),
            None => Err(SandpitError::UnsupportedLanguage(format!("unknown id {}", id))),
        }
    }

    fn list(&self) -> Vec<LanguageDescriptor> {
        self.languages
            .values()
            .filter(|l| !l.is_archived)
            .cloned()
            .collect()
    }
}

fn language(
    id: u32,
    name: &str,
    source_file: &str,
    compile_cmd: Option<&str>,
    run_cmd: &str,
) -> LanguageDescriptor {
    LanguageDescriptor {
        id,
        name: name.to_string(),
        source_file: source_file.to_string(),
        compile_cmd: compile_cmd.map(str::to_string),
        run_cmd: run_cmd.to_string(),
        default_time_limit: None,
        default_memory_limit: None,
        is_archived: false,
    }
}

/// Toolchain paths match the `judge0/compilers` image.
pub fn builtin_languages() -> Vec<LanguageDescriptor> {
    let mut java = language(
        62,
        "Java (OpenJDK 13.0.1)",
        "Main.java",
        Some("/usr/local/openjdk13/bin/javac %s Main.java"),
        "/usr/local/openjdk13/bin/java Main",
    );
    // The JVM needs headroom above the generic default.
    java.default_memory_limit = Some(256_000);

    vec![
        language(46, "Bash (5.0.0)", "script.sh", None, "/usr/local/bin/bash script.sh"),
        language(
            50,
            "C (GCC 9.2.0)",
            "main.c",
            Some("/usr/local/gcc-9.2.0/bin/gcc %s main.c"),
            "./a.out",
        ),
        language(
            54,
            "C++ (GCC 9.2.0)",
            "main.cpp",
            Some("/usr/local/gcc-9.2.0/bin/g++ %s main.cpp"),
            "./a.out",
        ),
        java,
        language(
            63,
            "JavaScript (Node.js 12.14.0)",
            "script.js",
            None,
            "/usr/local/node-12.14.0/bin/node script.js",
        ),
        language(
            71,
            "Python (3.8.1)",
            "script.py",
            None,
            "/usr/local/python-3.8.1/bin/python3 script.py",
        ),
        language(89, PROJECT_LANGUAGE_NAME, "", Some("/bin/bash compile"), "/bin/bash run"),
    ]
}
