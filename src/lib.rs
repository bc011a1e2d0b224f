//! dockside: incremental loads of bike-station snapshots into Delta Lake.
//!
//! A capture process drops one immutable, timestamp-named GBFS snapshot per
//! interval into an object store. dockside works out which of those
//! snapshots a Delta table does not hold yet and appends exactly those, one
//! atomic commit per snapshot, so that reruns, failures and overlapping runs
//! never leave duplicate or missing rows.
//!
//! # Example
//!
//! ```ignore
//! use dockside::{Config, Coordinator};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::from_file("dockside.yaml")?;
//! let (name, feed) = config.feeds.first().unwrap();
//! let coordinator = Coordinator::from_config(name, feed, &config, None).await?;
//! let summary = coordinator.run(&CancellationToken::new()).await?;
//! println!("Loaded {} snapshots", summary.loaded);
//! ```

pub mod config;
pub mod dlq;
pub mod error;
pub mod feed;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod polling;
pub mod retry;
pub mod signal;
pub mod sink;
pub mod snapshot;
pub mod source;
pub mod storage;
pub mod watermark;

// Re-export main types
pub use config::Config;
pub use pipeline::{Coordinator, LoadResult, LoadStatus, RunPlan, RunSummary};
pub use sink::{CommitOutcome, DeltaSnapshotTable, MemoryTable, SnapshotTable};
pub use snapshot::SnapshotTimestamp;
pub use source::{LakeSource, SnapshotSource};
pub use storage::{StorageProvider, StorageProviderRef};
