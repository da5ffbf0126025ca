//! marketcrawl Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Crawls the Visual Studio Code Marketplace page by page and persists every
//! extension into an append-only CSV file and a keyed SQLite table.
//!
//! # Components
//!
//! - **Fetcher**: paginated retrieval with retry, backoff and resumption
//! - **Ingestor**: normalization, deduplication and the per-page batch commit
//! - **Pipeline**: ties both together and maintains the resumption cursor
//!
//! # Example
//!
//! ```no_run
//! use marketcrawl_ingest::{MarketplaceClient, MarketplaceConfig, Pipeline, SinkConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let marketplace = MarketplaceConfig::builder().max_pages(5).build();
//!     let client = MarketplaceClient::new(&marketplace)?;
//!     let pipeline = Pipeline::open(client, marketplace, &SinkConfig::default()).await?;
//!     let summary = pipeline.run(5).await?;
//!     println!("committed {} pages", summary.pages_committed);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod cursor;
pub mod error;
pub mod fetcher;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod retry;

pub use config::{MarketplaceConfig, SinkConfig};
pub use error::{FetchError, IngestError, PageFailure, PipelineError, SchemaError, SinkWriteError};
pub use fetcher::{FetchedPage, Fetcher, MarketplaceClient, PageSource, SourcePage};
pub use ingest::{BatchReport, Ingestor};
pub use models::{CompositeKey, ExtensionRecord, RawExtension};
pub use pipeline::{Pipeline, RunSummary};
