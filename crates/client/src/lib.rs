//! Client side of the OCRD gateway: typed API calls, request logging,
//! job status polling, live updates and terminal rendering.

pub mod api;
pub mod error;
pub mod live;
pub mod logger;
pub mod poller;
#[cfg(test)]
mod test_support;
pub mod view;

pub use api::AnalysisClient;
pub use error::ClientError;
pub use live::LiveFeed;
pub use logger::{ClientLogger, LogEntry, LogLevel};
pub use poller::{PollEvent, StatusPoller, StatusSource, StopReason};
pub use view::{Badge, RunPhase, RunView};
