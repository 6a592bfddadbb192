use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ExecutionError;
use crate::models::{CommandSpec, JobOutput};

/// Placeholder replaced by the item reference in `BatchItem::from_template`.
pub const ITEM_PLACEHOLDER: &str = "{}";

/// One independent unit of a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchItem {
    /// Identity reported back in the batch report, e.g. the input path.
    pub item_ref: String,
    pub command: CommandSpec,
}

impl BatchItem {
    pub fn new(item_ref: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            item_ref: item_ref.into(),
            command,
        }
    }

    /// Instantiate a command template for one item. Every `{}` in the
    /// arguments and the result file path is replaced with the item
    /// reference; when no argument contains the placeholder the reference is
    /// appended as the last argument.
    pub fn from_template(item_ref: impl Into<String>, template: &CommandSpec) -> Self {
        let item_ref = item_ref.into();
        let mut command = template.clone();

        let mut substituted = false;
        for arg in command.args.iter_mut() {
            if arg.contains(ITEM_PLACEHOLDER) {
                *arg = arg.replace(ITEM_PLACEHOLDER, &item_ref);
                substituted = true;
            }
        }
        if !substituted {
            command.args.push(item_ref.clone());
        }

        if let Some(path) = command.result_file.take() {
            let path = path.to_string_lossy().replace(ITEM_PLACEHOLDER, &item_ref);
            command.result_file = Some(path.into());
        }

        Self { item_ref, command }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutput {
    Success(JobOutput),
    Error(ExecutionError),
}

impl ItemOutput {
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemOutput::Success(_) => ItemStatus::Success,
            ItemOutput::Error(_) => ItemStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchItemResult {
    pub item_ref: String,
    pub status: ItemStatus,
    #[serde(rename = "duration_secs", with = "duration_secs")]
    pub duration: Duration,
    pub output: ItemOutput,
}

impl BatchItemResult {
    pub fn new(item_ref: impl Into<String>, duration: Duration, output: ItemOutput) -> Self {
        Self {
            item_ref: item_ref.into(),
            status: output.status(),
            duration,
            output,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Success
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        match &self.output {
            ItemOutput::Error(err) => Some(err),
            ItemOutput::Success(_) => None,
        }
    }
}

/// Aggregate outcome of one batch run. Items are in completion order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub items: Vec<BatchItemResult>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(rename = "total_duration_secs", with = "duration_secs")]
    pub total_duration: Duration,
}

impl BatchReport {
    pub fn from_results(items: Vec<BatchItemResult>, total_duration: Duration) -> Self {
        let succeeded = items.iter().filter(|r| r.is_success()).count();
        Self {
            total: items.len(),
            failed: items.len() - succeeded,
            succeeded,
            items,
            total_duration,
        }
    }

    /// Percentage of items that succeeded; 0 for an empty batch.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64 * 100.0
    }

    /// Mean per-item wall-clock time; zero for an empty batch.
    pub fn average_duration(&self) -> Duration {
        if self.items.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.items.iter().map(|r| r.duration).sum();
        sum / self.items.len() as u32
    }

    pub fn result_for(&self, item_ref: &str) -> Option<&BatchItemResult> {
        self.items.iter().find(|r| r.item_ref == item_ref)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Batch Processing Report");
        let _ = writeln!(out, "=======================");
        let _ = writeln!(out);
        let _ = writeln!(out, "Items Processed: {}", self.total);
        let _ = writeln!(out, "Successful: {}", self.succeeded);
        let _ = writeln!(out, "Failed: {}", self.failed);
        let _ = writeln!(out, "Success Rate: {:.1}%", self.success_rate());
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Total Processing Time: {:.2} seconds",
            self.total_duration.as_secs_f64()
        );
        let _ = writeln!(
            out,
            "Average Time per Item: {:.2} seconds",
            self.average_duration().as_secs_f64()
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "Detailed Results:");
        for item in &self.items {
            let icon = if item.is_success() { "✅" } else { "❌" };
            let _ = write!(
                out,
                "{} {} ({:.2}s)",
                icon,
                item.item_ref,
                item.duration.as_secs_f64()
            );
            if let Some(err) = item.error() {
                let _ = write!(out, " - Error: {}", err);
            }
            let _ = writeln!(out);
        }
        out
    }

    pub fn write_text(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.render_text())
    }
}

/// Durations travel as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_item(item_ref: &str, millis: u64) -> BatchItemResult {
        BatchItemResult::new(
            item_ref,
            Duration::from_millis(millis),
            ItemOutput::Success(JobOutput {
                exit_code: 0,
                log_lines: 1,
                document: None,
            }),
        )
    }

    fn failed_item(item_ref: &str, millis: u64) -> BatchItemResult {
        BatchItemResult::new(
            item_ref,
            Duration::from_millis(millis),
            ItemOutput::Error(ExecutionError::NonZeroExit {
                code: Some(2),
                signal: None,
                output_tail: vec!["boom".to_string()],
            }),
        )
    }

    #[test]
    fn test_from_template_substitutes_placeholder() {
        let template = CommandSpec::new("predict")
            .args(["--input", "{}", "--output", "out/{}.csv"])
            .result_file("out/{}.json");
        let item = BatchItem::from_template("seq1.fasta", &template);
        assert_eq!(item.item_ref, "seq1.fasta");
        assert_eq!(
            item.command.args,
            vec!["--input", "seq1.fasta", "--output", "out/seq1.fasta.csv"]
        );
        assert_eq!(
            item.command.result_file,
            Some(std::path::PathBuf::from("out/seq1.fasta.json"))
        );
    }

    #[test]
    fn test_from_template_appends_when_no_placeholder() {
        let template = CommandSpec::new("wc").arg("-l");
        let item = BatchItem::from_template("a b.txt", &template);
        assert_eq!(item.command.args, vec!["-l", "a b.txt"]);
    }

    #[test]
    fn test_report_counts() {
        let report = BatchReport::from_results(
            vec![ok_item("a", 10), failed_item("b", 20), ok_item("c", 30)],
            Duration::from_millis(40),
        );
        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded + report.failed, report.total);
        assert!((report.success_rate() - 66.666).abs() < 0.01);
        assert_eq!(report.average_duration(), Duration::from_millis(20));
        assert!(report.result_for("b").is_some_and(|r| !r.is_success()));
        assert!(report.result_for("zzz").is_none());
    }

    #[test]
    fn test_empty_report() {
        let report = BatchReport::from_results(vec![], Duration::ZERO);
        assert_eq!(report.total, 0);
        assert_eq!(report.success_rate(), 0.0);
        assert_eq!(report.average_duration(), Duration::ZERO);
    }

    #[test]
    fn test_render_text_lists_every_item() {
        let report = BatchReport::from_results(
            vec![ok_item("good.fasta", 1500), failed_item("bad.fasta", 250)],
            Duration::from_secs(2),
        );
        let text = report.render_text();
        assert!(text.contains("Items Processed: 2"));
        assert!(text.contains("Successful: 1"));
        assert!(text.contains("Failed: 1"));
        assert!(text.contains("Success Rate: 50.0%"));
        assert!(text.contains("✅ good.fasta (1.50s)"));
        assert!(text.contains("❌ bad.fasta (0.25s) - Error: process exited with code 2"));
    }

    #[test]
    fn test_item_result_serializes_duration_as_seconds() {
        let json = serde_json::to_value(ok_item("a", 1500)).expect("serialize");
        assert_eq!(json["duration_secs"], 1.5);
        assert_eq!(json["status"], "Success");
        assert_eq!(json["output"]["success"]["exit_code"], 0);
    }

    #[test]
    fn test_write_text_creates_file() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("report.txt");
        let report = BatchReport::from_results(vec![ok_item("x", 5)], Duration::from_millis(5));
        report.write_text(&path).expect("write");
        let content = std::fs::read_to_string(&path).expect("read");
        assert!(content.starts_with("Batch Processing Report"));
    }
}
