//! Cardinality diagnostics, malformed queries and attachment rules as seen
//! through the public engine API.

mod common;

use common::{local, settle, Fixture, Recorder};

use livequery_core::element::{ElementSpec, VISIBILITY};
use livequery_core::error::EngineError;
use livequery_core::matching::MatchFilter;
use livequery_core::outcome::{AttachmentKey, Outcome, Severity};
use livequery_core::tree::Tree;

// ---------------------------------------------------------------------------
// Single-match view
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_zero_matches_is_a_warning() {
    local(async {
        let fx = Fixture::new(2);
        let single = Recorder::start(&fx.engine.single("//button"));
        let outcome = single.last().unwrap();

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["severity"], "warn");
        assert_eq!(json["error"], "matched 0 elements.");
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_too_many_matches_reports_live_count() {
    local(async {
        let fx = Fixture::new(2);
        let single = Recorder::start(&fx.engine.single("//li"));
        assert_eq!(
            single.last().unwrap().error_message(),
            Some("matched 2 elements (need exactly 1).")
        );

        fx.add_item("third");
        settle().await;
        assert_eq!(
            single.last().unwrap().error_message(),
            Some("matched 3 elements (need exactly 1).")
        );
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_warning_resolves_when_tree_changes() {
    local(async {
        let fx = Fixture::new(2);
        let single = Recorder::start(&fx.engine.single("//li"));
        assert!(!single.last().unwrap().is_ok());

        fx.tree.remove(fx.items()[0]).unwrap();
        settle().await;
        let last = single.last().unwrap();
        assert_eq!(last.value(), Some(&fx.items()[0]));
        assert_eq!(single.len(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_hidden_only_match_reports_element_hidden() {
    local(async {
        let fx = Fixture::new(1);
        let item = fx.items()[0];
        fx.tree.set_attribute(item, "hidden", "").unwrap();
        settle().await;

        let single = Recorder::start(&fx.engine.single("//li"));
        assert_eq!(single.last().unwrap().error_message(), Some("element hidden"));
        assert_eq!(single.last().unwrap().severity(), Some(Severity::Warn));

        fx.tree.remove_attribute(item, "hidden").unwrap();
        settle().await;
        assert_eq!(single.last().unwrap().value(), Some(&item));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_elements_view_filters() {
    local(async {
        let fx = Fixture::new(3);
        fx.tree.set_attribute(fx.items()[1], "hidden", "").unwrap();
        settle().await;

        let any = Recorder::start(&fx.engine.elements("//li", MatchFilter::any()));
        assert_eq!(any.last().unwrap().value().map(Vec::len), Some(3));

        let visible = MatchFilter {
            visible_only: true,
            allow_multiple: true,
        };
        let shown = Recorder::start(&fx.engine.elements("//li", visible));
        assert_eq!(shown.last().unwrap().value().map(Vec::len), Some(2));

        let empty = Recorder::start(&fx.engine.elements("//table", MatchFilter::any()));
        assert_eq!(empty.last().unwrap().error_message(), Some("matched 0 elements."));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_keep_visibility_attachment() {
    local(async {
        let fx = Fixture::new(2);
        let single = Recorder::start(&fx.engine.single("//li"));
        let summary = single.last().unwrap().attachment(&VISIBILITY).copied();
        assert_eq!(summary.map(|s| (s.total, s.visible)), Some((2, 2)));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_mapped_view_keeps_attachments_and_failures() {
    local(async {
        let fx = Fixture::new(2);
        let counts = Recorder::start(&fx.engine.observe("//li").map_ok(|infos| infos.len()));
        let first = counts.last().unwrap();
        assert_eq!(first.value(), Some(&2));
        assert_eq!(first.attachment(&VISIBILITY).map(|s| s.total), Some(2));

        let broken = Recorder::start(&fx.engine.observe("//li[").map_ok(|infos| infos.len()));
        assert_eq!(broken.last().unwrap().severity(), Some(Severity::Err));

        fx.add_item("third");
        settle().await;
        assert_eq!(counts.last().unwrap().value(), Some(&3));
    })
    .await;
}

// ---------------------------------------------------------------------------
// Malformed queries
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_malformed_query_is_reported_once_and_never_retried() {
    local(async {
        let fx = Fixture::new(1);
        let broken = Recorder::start(&fx.engine.observe("//li[@class='item'"));
        assert_eq!(fx.tree.listener_count(), 0);

        fx.add_item("more");
        settle().await;

        assert_eq!(broken.len(), 1);
        let outcome = broken.last().unwrap();
        assert_eq!(outcome.severity(), Some(Severity::Err));
        assert!(outcome.error_message().unwrap().contains("offset"));

        // The corrected query is a separate live query.
        let fixed = Recorder::start(&fx.engine.observe("//li[@class='item']"));
        assert!(fixed.last().unwrap().is_ok());
        assert_eq!(fx.engine.cache().len(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_query_through_derived_views() {
    local(async {
        let fx = Fixture::new(1);
        let text = Recorder::start(&fx.engine.text("li"));
        assert_eq!(text.last().unwrap().severity(), Some(Severity::Err));
        fx.tree
            .append_child(fx.tree.root(), &ElementSpec::new("li"))
            .unwrap();
        settle().await;
        assert_eq!(text.len(), 1);
    })
    .await;
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

const SOURCE: AttachmentKey<&'static str> = AttachmentKey::new("source");

#[test]
fn test_attaching_same_key_twice_fails() {
    let mut outcome = Outcome::ok(1);
    outcome.attach(&SOURCE, "first").unwrap();
    assert_eq!(
        outcome.attach(&SOURCE, "second"),
        Err(EngineError::DuplicateAttachment("source"))
    );
}

#[test]
fn test_merging_colliding_attachments_fails() {
    let left = Outcome::ok(1).with_attachment(&SOURCE, "left").unwrap();
    let mut right: Outcome<i32> = Outcome::warn("pending").with_attachment(&SOURCE, "right").unwrap();
    assert_eq!(
        right.merge_with(left.attachments()),
        Err(EngineError::AttachmentCollision("source"))
    );

    let chained = left.and_then(|n| Outcome::ok(n + 1).with_attachment(&SOURCE, "inner").unwrap());
    assert_eq!(chained.unwrap_err(), EngineError::AttachmentCollision("source"));
}
