//! Replays a mutation script against a live tree.

use std::time::Duration;

use livequery_core::memory::MemoryTree;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

use crate::script::{Step, StepError};

/// A step that failed, with its position in the script.
#[derive(Debug)]
pub struct ReplayFailure {
    /// Zero-based index of the failed step.
    pub index: usize,
    /// Operation name of the failed step.
    pub op: &'static str,
    /// What went wrong.
    pub error: StepError,
}

impl std::fmt::Display for ReplayFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step {} ({}): {}", self.index, self.op, self.error)
    }
}

/// Applies `steps` in order, sleeping until each step's `at_ms` offset from
/// the moment replay starts.
///
/// Stops at the first failing step. Mutations already applied stay applied.
pub async fn replay(tree: &MemoryTree, steps: &[Step]) -> Result<usize, ReplayFailure> {
    let span = info_span!("replay", steps = steps.len());
    async {
        let start = Instant::now();
        for (index, step) in steps.iter().enumerate() {
            tokio::time::sleep_until(start + Duration::from_millis(step.at_ms)).await;
            let op = step.mutation.name();
            let node = step
                .mutation
                .apply(tree)
                .map_err(|error| ReplayFailure { index, op, error })?;
            debug!(
                index,
                op,
                at_ms = step.at_ms,
                %node,
                tag = %tree.tag(node).unwrap_or_default(),
                target = step.mutation.target(),
                "Applied step"
            );
        }
        Ok(steps.len())
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse;
    use livequery_core::element::ElementSpec;
    use livequery_core::memory::DeliveryMode;
    use livequery_core::tree::Tree;

    fn tree() -> MemoryTree {
        let spec = ElementSpec::new("ul").child(ElementSpec::new("li").text("a"));
        MemoryTree::from_spec(&spec, DeliveryMode::Manual)
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_each_offset() {
        let tree = tree();
        let steps = parse(
            r#"[
                {"at_ms": 0, "op": "append", "target": "//ul", "element": {"tag": "li"}},
                {"at_ms": 250, "op": "remove", "target": "//li[1]"}
            ]"#,
        )
        .unwrap();

        let start = Instant::now();
        assert_eq!(replay(&tree, &steps).await.unwrap(), 2);
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(tree.evaluate("//li").unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_failure() {
        let tree = tree();
        let steps = parse(
            r#"[
                {"op": "set_text", "target": "//li", "text": "b"},
                {"op": "remove", "target": "//table"},
                {"op": "remove", "target": "//li"}
            ]"#,
        )
        .unwrap();

        let failure = replay(&tree, &steps).await.unwrap_err();
        assert_eq!(failure.index, 1);
        assert_eq!(failure.op, "remove");
        assert_eq!(failure.to_string(), "step 1 (remove): target `//table` matched nothing");
        assert_eq!(tree.evaluate("//li").unwrap().len(), 1);
    }
}
