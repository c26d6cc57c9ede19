//! # livequery-core
//!
//! Live queries over a mutable element tree.
//!
//! A live query re-evaluates a query string whenever the tree changes in a
//! way that could alter its result, and pushes deduplicated outcomes to every
//! subscriber. Listener registrations are shared and reference-counted, so any
//! number of overlapping queries costs at most one physical listener per
//! observed node.
//!
//! ## Modules
//!
//! - [`stream`] - Single-threaded push streams and their operators
//! - [`subject`] - Multicast subjects and `share_replay`
//! - [`outcome`] - Success/failure values with write-once attachments
//! - [`tree`] - The host tree trait and mutation records
//! - [`memory`] - In-memory host tree
//! - [`selector`] - Path expressions evaluated by the in-memory tree
//! - [`mutation`] - Shared physical change listeners
//! - [`invalidate`] - Recompute-on-demand projection operator
//! - [`reconcile`] - One subscription per key of a changing key set
//! - [`cache`] - Reference-counted memoization of live views
//! - [`matching`] - Cardinality checks over match sets
//! - [`engine`] - The live query pipeline
//! - [`config`] - Persistent engine configuration
//! - [`element`] - Element snapshots and tree descriptions
//! - [`error`] - Error types
//!
//! ## Runtime
//!
//! Nothing here is `Send`. Throttle timers and the in-memory tree's batched
//! delivery run on [`tokio::task::spawn_local`], so drive the engine from a
//! current-thread runtime inside a [`tokio::task::LocalSet`].
//!
//! ## Example
//!
//! ```no_run
//! use std::rc::Rc;
//! use livequery_core::config::EngineConfig;
//! use livequery_core::element::ElementSpec;
//! use livequery_core::engine::Engine;
//! use livequery_core::memory::MemoryTree;
//! use livequery_core::tree::Tree;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let local = tokio::task::LocalSet::new();
//!     local
//!         .run_until(async {
//!             let spec = ElementSpec::new("ul").child(ElementSpec::new("li"));
//!             let tree = MemoryTree::new();
//!             let list = tree.append_child(tree.root(), &spec).expect("root exists");
//!             let engine = Engine::new(Rc::new(tree.clone()), EngineConfig::load());
//!             let _sub = engine.observe("//li").for_each(|outcome| {
//!                 println!("{}", serde_json::to_string(&outcome).unwrap_or_default());
//!             });
//!             tree.append_child(list, &ElementSpec::new("li")).expect("list exists");
//!             tokio::task::yield_now().await;
//!         })
//!         .await;
//! }
//! ```

pub mod cache;
pub mod config;
pub mod element;
pub mod engine;
pub mod error;
pub mod invalidate;
pub mod matching;
pub mod memory;
pub mod mutation;
pub mod outcome;
pub mod reconcile;
pub mod selector;
pub mod stream;
pub mod subject;
pub mod tree;
