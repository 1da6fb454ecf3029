pub mod error;
pub mod config;
pub mod status;
pub mod job;
pub mod cache;
pub mod reconcile;
pub mod transport;
pub mod coalesce;
pub mod backend;
pub mod coverage;
pub mod stream;
pub mod http;
pub mod engine;

pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use status::{normalize, CanonicalStatus};
pub use job::{Job, JobCommand, JobId, JobScope, JobStats};
pub use reconcile::{DeltaKind, JobDelta};
pub use transport::{TransportMode, TransportState};
pub use backend::{Backends, Capabilities};
pub use coverage::CoverageEntry;
pub use stream::{IngestEvent, RepairCandidate, RepairPreview, RepairRequest};
pub use http::HttpBackend;
pub use engine::{Engine, EngineSnapshot, EngineUpdate, JobsUpdate, Notice, NoticeKind};
