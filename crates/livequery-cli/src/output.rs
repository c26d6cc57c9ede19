//! Emission formatting.

use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use livequery_core::outcome::Outcome;
use serde::Serialize;

/// Which live view to print for each query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    /// Every match with its visibility.
    Observe,
    /// All matches, hidden ones included; fails only on zero matches.
    Elements,
    /// Exactly one visible match.
    Single,
    /// Text content of the single visible match.
    Text,
}

/// Output format for emissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per line
    Json,
    /// Human-readable lines
    Text,
}

/// One value pushed by a live view.
#[derive(Serialize)]
pub struct Emission<'a, T> {
    pub timestamp: DateTime<Utc>,
    pub query: &'a str,
    pub view: View,
    pub outcome: &'a Outcome<T>,
}

impl<'a, T: Serialize> Emission<'a, T> {
    pub fn now(query: &'a str, view: View, outcome: &'a Outcome<T>) -> Self {
        Self {
            timestamp: Utc::now(),
            query,
            view,
            outcome,
        }
    }

    /// Renders the emission as a single line.
    pub fn render(&self, format: OutputFormat) -> Result<String, serde_json::Error> {
        match format {
            OutputFormat::Json => serde_json::to_string(self),
            OutputFormat::Text => {
                let status = match (self.outcome.value(), self.outcome.error_message()) {
                    (Some(value), _) => format!("ok {}", serde_json::to_string(value)?),
                    (None, message) => format!(
                        "{} {}",
                        self.outcome.severity().map(|s| s.to_string()).unwrap_or_default(),
                        message.unwrap_or_default()
                    ),
                };
                Ok(format!(
                    "{} {:?} {}: {}",
                    self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                    self.view,
                    self.query,
                    status
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livequery_core::tree::NodeId;

    #[test]
    fn json_line_carries_query_view_and_outcome() {
        let outcome = Outcome::ok(NodeId(4));
        let line = Emission::now("//li", View::Single, &outcome)
            .render(OutputFormat::Json)
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["query"], "//li");
        assert_eq!(json["view"], "single");
        assert_eq!(json["outcome"], serde_json::json!({"ok": true, "value": 4}));
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn text_line_shows_severity_and_message() {
        let outcome: Outcome<NodeId> = Outcome::warn("matched 0 elements.");
        let line = Emission::now("//li", View::Single, &outcome)
            .render(OutputFormat::Text)
            .unwrap();
        assert!(line.ends_with("Single //li: warn matched 0 elements."), "{line}");
    }

    #[test]
    fn text_line_shows_value_as_json() {
        let outcome = Outcome::ok("hello".to_string());
        let line = Emission::now("//p", View::Text, &outcome)
            .render(OutputFormat::Text)
            .unwrap();
        assert!(line.ends_with("Text //p: ok \"hello\""), "{line}");
    }
}
