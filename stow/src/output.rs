//! Output formatting for CLI commands.
//!
//! Every command produces a serializable DTO. In JSON mode the DTO is printed
//! as pretty JSON, otherwise a closure renders the human-readable text.

use anyhow::Result;
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use stow_core::{
    CasObject, CasPool, CasStats, CasValidationResult, ContentHash, GcStats, MaterializationResult,
    PlacementOutcome, ReferenceStats, WorkspaceStrategy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Write `data` as JSON, or the text produced by `text_fn`.
    ///
    /// `text_fn` is only called in text mode.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error to stderr, as a JSON object in JSON mode.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

/// Render a byte count for people.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init` command.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installation_root: Option<PathBuf>,
    pub algorithm: String,
}

/// Object stored during `store` command.
#[derive(Debug, Clone, Serialize)]
pub struct StoredObject {
    pub hash: ContentHash,
    pub source: String,
    pub path: PathBuf,
}

/// Output for `store` command.
#[derive(Debug, Serialize)]
pub struct StoreOutput {
    pub success: bool,
    pub result_code: u8,
    pub pool: CasPool,
    pub objects: Vec<StoredObject>,
}

/// Output for `path` command.
#[derive(Debug, Serialize)]
pub struct PathOutput {
    pub success: bool,
    pub result_code: u8,
    pub hash: ContentHash,
    pub pool: CasPool,
    pub path: PathBuf,
}

/// Output for `stat` command.
#[derive(Debug, Serialize)]
pub struct StatOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub object: CasObject,
    pub path: PathBuf,
    pub created_at_human: String,
    pub last_accessed_at_human: String,
}

/// Output for `stats` command.
#[derive(Debug, Serialize)]
pub struct StatsOutput {
    pub success: bool,
    pub result_code: u8,
    pub pools: Vec<CasStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ReferenceStats>,
}

/// Output for `gc` command.
#[derive(Debug, Serialize)]
pub struct GcOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    pub live_objects: usize,
    pub pools: Vec<PoolGcStats>,
}

#[derive(Debug, Serialize)]
pub struct PoolGcStats {
    pub pool: CasPool,
    #[serde(flatten)]
    pub stats: GcStats,
}

/// Output for `validate` command.
#[derive(Debug, Serialize)]
pub struct ValidateOutput {
    pub success: bool,
    pub result_code: u8,
    pub pools: Vec<CasValidationResult>,
}

/// Output for `scan` command.
#[derive(Debug, Serialize)]
pub struct ScanOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: PathBuf,
    pub files: usize,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

/// Output for `materialize` command.
#[derive(Debug, Serialize)]
pub struct MaterializeOutput {
    pub success: bool,
    pub result_code: u8,
    pub target: PathBuf,
    pub strategy: WorkspaceStrategy,
    pub cancelled: bool,
    pub placed: usize,
    pub degraded: usize,
    pub failed: usize,
    pub outcomes: Vec<PlacementOutcome>,
}

impl MaterializeOutput {
    pub fn new(
        target: PathBuf,
        strategy: WorkspaceStrategy,
        result: MaterializationResult,
        result_code: u8,
    ) -> Self {
        Self {
            success: result.is_success(),
            result_code,
            target,
            strategy,
            cancelled: result.cancelled,
            placed: result.succeeded().count(),
            degraded: result.degraded().count(),
            failed: result.failed().count(),
            outcomes: result.outcomes.into_values().collect(),
        }
    }
}
