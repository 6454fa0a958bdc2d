//! Line grammar emitted by workers into their log files.
//!
//! ```text
//! PROGRESS:<stage>:<step>[:<details>]
//! FINAL_OUTPUT_PATH:<path>
//! PIPELINE_PROCESS_COMPLETED
//! PIPELINE_PROCESS_ERROR:<message>
//! PIPELINE_PROCESS_EXITING
//! ```

use std::path::PathBuf;

use tracing::warn;

pub const PROGRESS_PREFIX: &str = "PROGRESS:";
pub const FINAL_OUTPUT_PREFIX: &str = "FINAL_OUTPUT_PATH:";
pub const COMPLETED_MARKER: &str = "PIPELINE_PROCESS_COMPLETED";
pub const ERROR_PREFIX: &str = "PIPELINE_PROCESS_ERROR:";
pub const EXITING_MARKER: &str = "PIPELINE_PROCESS_EXITING";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Progress {
        stage: String,
        step: String,
        details: Option<String>,
    },
    FinalOutput(PathBuf),
    Completed,
    Error(String),
    Exiting,
}

impl Directive {
    /// `Completed` and `Error` select a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error(_))
    }
}

/// Parses one log line. Ordinary log text yields `None`.
pub fn parse_line(line: &str) -> Option<Directive> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) {
        return parse_progress(rest);
    }
    if let Some(message) = line.strip_prefix(ERROR_PREFIX) {
        return Some(Directive::Error(message.trim().to_string()));
    }
    if let Some(path) = line.strip_prefix(FINAL_OUTPUT_PREFIX) {
        let path = path.trim();
        if path.is_empty() {
            warn!(line = %line, "discarding final output directive without a path");
            return None;
        }
        return Some(Directive::FinalOutput(PathBuf::from(path)));
    }
    if line.starts_with(COMPLETED_MARKER) {
        return Some(Directive::Completed);
    }
    if line.starts_with(EXITING_MARKER) {
        return Some(Directive::Exiting);
    }
    None
}

fn parse_progress(rest: &str) -> Option<Directive> {
    let mut parts = rest.trim().splitn(3, ':');
    let stage = parts.next().map(str::trim).unwrap_or_default();
    let step = parts.next().map(str::trim).unwrap_or_default();
    if stage.is_empty() || step.is_empty() {
        warn!(directive = %rest, "discarding malformed progress directive");
        return None;
    }

    let details = parts
        .next()
        .map(str::trim)
        .filter(|details| !details.is_empty())
        .map(str::to_string);

    Some(Directive::Progress {
        stage: stage.to_string(),
        step: step.to_string(),
        details,
    })
}

/// Directives selected from one batch of newly read lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// Last `PROGRESS` directive in the batch.
    pub progress: Option<Directive>,
    /// Last `COMPLETED` or `ERROR` marker in the batch.
    pub terminal: Option<Directive>,
    pub final_output: Option<PathBuf>,
    pub exiting: bool,
}

impl Batch {
    pub fn scan<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut batch = Self::default();
        for directive in lines.into_iter().filter_map(parse_line) {
            match directive {
                Directive::Progress { .. } => batch.progress = Some(directive),
                Directive::FinalOutput(path) => batch.final_output = Some(path),
                Directive::Exiting => batch.exiting = true,
                Directive::Completed | Directive::Error(_) => batch.terminal = Some(directive),
            }
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.progress.is_none()
            && self.terminal.is_none()
            && self.final_output.is_none()
            && !self.exiting
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Batch, Directive, parse_line};

    #[test]
    fn progress_with_details_containing_colons() {
        assert_eq!(
            parse_line("PROGRESS:webcrawl:extract_llm:1/8:Extracting data from https://a.b\n"),
            Some(Directive::Progress {
                stage: "webcrawl".to_string(),
                step: "extract_llm".to_string(),
                details: Some("1/8:Extracting data from https://a.b".to_string()),
            })
        );
    }

    #[test]
    fn progress_without_details() {
        assert_eq!(
            parse_line("  PROGRESS:integration:main  "),
            Some(Directive::Progress {
                stage: "integration".to_string(),
                step: "main".to_string(),
                details: None,
            })
        );
    }

    #[test]
    fn malformed_progress_is_discarded() {
        assert_eq!(parse_line("PROGRESS:webcrawl"), None);
        assert_eq!(parse_line("PROGRESS::main:1/2"), None);
        assert_eq!(parse_line("PROGRESS:webcrawl::1/2"), None);
    }

    #[test]
    fn ordinary_lines_are_not_directives() {
        assert_eq!(parse_line("2024-01-01 INFO crawling example.com"), None);
        assert_eq!(parse_line("progress:webcrawl:main"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn markers() {
        assert_eq!(
            parse_line("PIPELINE_PROCESS_COMPLETED"),
            Some(Directive::Completed)
        );
        assert_eq!(
            parse_line("PIPELINE_PROCESS_ERROR: webcrawl: timeout"),
            Some(Directive::Error("webcrawl: timeout".to_string()))
        );
        assert_eq!(
            parse_line("PIPELINE_PROCESS_EXITING"),
            Some(Directive::Exiting)
        );
        assert_eq!(
            parse_line("FINAL_OUTPUT_PATH:/out/final.csv"),
            Some(Directive::FinalOutput(PathBuf::from("/out/final.csv")))
        );
    }

    #[test]
    fn batch_keeps_last_progress_and_last_terminal() {
        let batch = Batch::scan([
            "PROGRESS:webcrawl:crawl_domain",
            "PIPELINE_PROCESS_ERROR:first",
            "PROGRESS:webcrawl:extract_llm:3/10",
            "PIPELINE_PROCESS_COMPLETED",
            "done",
        ]);

        assert_eq!(batch.terminal, Some(Directive::Completed));
        assert!(matches!(
            batch.progress,
            Some(Directive::Progress { ref step, .. }) if step == "extract_llm"
        ));
        assert!(!batch.exiting);
    }

    #[test]
    fn batch_without_directives_is_empty() {
        assert!(Batch::scan(["plain", "text"]).is_empty());
    }
}
