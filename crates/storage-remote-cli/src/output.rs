//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde_json::Value;

use storage_remote_core::storage::{ChangeEventBulk, StorageDocument};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print documents returned by a query
    pub fn print_documents(&self, documents: &[StorageDocument]) {
        match self.format {
            OutputFormat::Human => {
                if documents.is_empty() {
                    println!("No documents found.");
                    return;
                }
                for doc in documents {
                    println!(
                        "{} | {} | {}",
                        truncate(&doc.id, 20),
                        truncate(&doc.rev, 12),
                        truncate(&Value::Object(doc.data.clone()).to_string(), 50)
                    );
                }
                println!("\n{} document(s)", documents.len());
            }
            OutputFormat::Json => match serde_json::to_string_pretty(documents) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Failed to encode documents: {}", e),
            },
            OutputFormat::Quiet => {
                for doc in documents {
                    println!("{}", doc.id);
                }
            }
        }
    }

    /// Print a change event bulk received from the remote side
    pub fn print_changes(&self, bulk: &ChangeEventBulk) {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "── Change bulk {} ({} event(s), context '{}') ──",
                    truncate(&bulk.id, 8),
                    bulk.events.len(),
                    bulk.context
                );
                for event in &bulk.events {
                    println!("{:?} {}", event.operation, event.document_id);
                }
            }
            OutputFormat::Json => match serde_json::to_string(bulk) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Failed to encode change event: {}", e),
            },
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééé", 5), "éé...");
    }
}
