pub mod collaborators;
pub mod config;
pub mod data;
pub mod db;
pub mod discovery;
pub mod error;
pub mod extraction;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod telemetry;
pub mod text;
pub mod urls;
pub mod verification;

pub use collaborators::{CollaboratorError, Gazetteer, TextClassifier};
pub use config::{PipelineConfig, RunOptions};
pub use data::{Database, StatusCount};
pub use error::{PipelineError, Result, StoreError, TelemetryError};
pub use model::{
    Article, ArticleStatus, CandidateLink, CandidateStatus, Classification, Dataset, DatasetScope,
    DeadReason, NewSource, PauseReason, PlaceEntity, Source, SourceStatus, StrategyKind,
};
pub use pipeline::{HousekeepingReport, Pipeline, RunReport};
pub use telemetry::{EventKind, TelemetryEvent, TelemetryMode, TelemetryReader, TelemetryStore};
