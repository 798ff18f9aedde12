//! Crawl job generation and a lease-coordinated worker queue.
//!
//! Generation: [`ParameterExpander`] → [`UrlCompiler`] → [`DuplicateTracker`]
//! → [`QueueWriter`], driven over a page tree by [`JobGenerator`].
//! Execution: [`ProcessManager`] hands out worker leases consumed by
//! [`RunLoop`], which claims due entries from the same queue.

pub mod config;
pub mod error;
pub mod hash;
pub mod status;
pub mod traits;
pub mod types;

// Generation
pub mod compile;
pub mod configuration;
pub mod exclude;
pub mod expand;
pub mod generator;
pub mod writer;

// Execution
pub mod executor;
pub mod process;
pub mod runner;
pub mod switch;

// Collaborators
pub mod site;
pub mod storage;

pub use compile::UrlCompiler;
pub use config::CrawlerSettings;
pub use configuration::CrawlConfiguration;
pub use error::{CrawlerError, Result};
pub use exclude::ExcludeCache;
pub use executor::CommandJobExecutor;
pub use expand::{ExpandedParameters, ParameterExpander, ParameterSpec};
pub use generator::{
    DuplicateTracker, GenerationMode, GenerationOptions, GenerationReport, JobGenerator,
    PageOutcome, UrlStatus,
};
pub use process::ProcessManager;
pub use runner::RunLoop;
pub use site::StaticSite;
pub use status::CliStatus;
pub use storage::{MemoryStorage, PostgresRecordLookup, PostgresStorage};
pub use switch::FileCrawlerSwitch;
pub use traits::{
    Clock, ConfigurationSource, CrawlerStorage, CrawlerSwitch, ExpansionHook, FixedClock,
    JobExecutor, PageTree, PageVeto, ProcessRepository, QueueRepository, RecordLookup,
    SystemClock,
};
pub use types::{ExecutionResult, JobParameters, NewQueueEntry, PageRow, Process, QueueEntry};
pub use writer::{QueueWriter, UrlJob};
