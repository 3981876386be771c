//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use docsync_core::connection::ConnectionStatus;
use docsync_core::transport::{ContentAssistEntry, HoverResult, OccurrencesResult, TextRegion};
use docsync_core::{Cancellable, SessionEvent, TextChange};

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

    /// Print the state id the server acknowledged
    pub fn print_state(&self, resource: &str, state_id: Option<&str>) {
        match self.format {
            OutputFormat::Human => {
                println!("Resource: {}", resource);
                println!("State:    {}", state_id.unwrap_or("(unknown)"));
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"resource": resource, "stateId": state_id})
                );
            }
            OutputFormat::Quiet => {
                if let Some(state_id) = state_id {
                    println!("{}", state_id);
                }
            }
        }
    }

    /// Print the document after formatting
    pub fn print_formatted(&self, text: &str, change: &TextChange) {
        match self.format {
            OutputFormat::Human | OutputFormat::Quiet => print!("{}", text),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "text": text,
                        "replaced": {
                            "offset": change.offset,
                            "length": change.removed_len,
                        },
                    })
                );
            }
        }
    }

    pub fn print_hover(&self, result: &Cancellable<HoverResult>) {
        let Cancellable::Completed(hover) = result else {
            self.cancelled();
            return;
        };
        match self.format {
            OutputFormat::Human => {
                if let Some(ref title) = hover.title {
                    println!("{}", title);
                    println!();
                }
                println!("{}", hover.content.as_deref().unwrap_or("(no information)"));
            }
            OutputFormat::Json => {
                println!("{}", json_string(hover));
            }
            OutputFormat::Quiet => {
                if let Some(ref content) = hover.content {
                    println!("{}", content);
                }
            }
        }
    }

    pub fn print_occurrences(&self, result: &Cancellable<OccurrencesResult>) {
        let Cancellable::Completed(occurrences) = result else {
            self.cancelled();
            return;
        };
        match self.format {
            OutputFormat::Human => {
                if occurrences.write_regions.is_empty() && occurrences.read_regions.is_empty() {
                    println!("No occurrences found.");
                    return;
                }
                for region in &occurrences.write_regions {
                    println!("write {}", format_region(region));
                }
                for region in &occurrences.read_regions {
                    println!("read  {}", format_region(region));
                }
            }
            OutputFormat::Json => {
                println!("{}", json_string(occurrences));
            }
            OutputFormat::Quiet => {
                for region in occurrences
                    .write_regions
                    .iter()
                    .chain(&occurrences.read_regions)
                {
                    println!("{}", region.offset);
                }
            }
        }
    }

    pub fn print_proposals(&self, entries: &[ContentAssistEntry]) {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("No proposals.");
                    return;
                }
                for entry in entries {
                    let label = entry.label.as_deref().unwrap_or(&entry.proposal);
                    match entry.description {
                        Some(ref description) => {
                            println!("{} | {}", truncate(label, 40), description)
                        }
                        None => println!("{}", label),
                    }
                }
                println!("\n{} proposal(s)", entries.len());
            }
            OutputFormat::Json => {
                println!("{}", json_string(entries));
            }
            OutputFormat::Quiet => {
                for entry in entries {
                    println!("{}", entry.proposal);
                }
            }
        }
    }

    pub fn print_session_event(&self, event: &SessionEvent) {
        match (self.format, event) {
            (OutputFormat::Quiet, _) => {}
            (OutputFormat::Json, SessionEvent::Connected) => {
                println!("{}", serde_json::json!({"event": "connected"}));
            }
            (OutputFormat::Json, SessionEvent::Disconnected) => {
                println!("{}", serde_json::json!({"event": "disconnected"}));
            }
            (OutputFormat::Json, SessionEvent::Push(push)) => {
                println!("{}", serde_json::json!({"event": "push", "message": push}));
            }
            (OutputFormat::Human, SessionEvent::Connected) => println!("● Connected"),
            (OutputFormat::Human, SessionEvent::Disconnected) => println!("○ Disconnected"),
            (OutputFormat::Human, SessionEvent::Push(push)) => {
                println!("← {}: {}", push.push_service, push.push);
            }
        }
    }

    pub fn print_status(&self, status: &ConnectionStatus) {
        match self.format {
            OutputFormat::Human => {
                match status.recent_errors.last() {
                    Some(error) => println!("  connection: {} ({})", status.phase, error),
                    None => println!("  connection: {}", status.phase),
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "event": "status",
                        "phase": status.phase.to_string(),
                        "open": status.is_open,
                        "errors": status.recent_errors,
                    })
                );
            }
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

    fn cancelled(&self) {
        match self.format {
            OutputFormat::Human | OutputFormat::Quiet => println!("cancelled"),
            OutputFormat::Json => println!("{}", serde_json::json!({"cancelled": true})),
        }
    }
}

fn json_string<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

fn format_region(region: &TextRegion) -> String {
    format!("{}..{}", region.offset, region.end())
}

/// Truncate a string to max chars, adding "..." if truncated
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
        assert_eq!(truncate("αβγδεζηθικλ", 6), "αβγ...");
    }

    #[test]
    fn test_format_region() {
        let region = TextRegion {
            offset: 5,
            length: 3,
        };
        assert_eq!(format_region(&region), "5..8");
    }
}
