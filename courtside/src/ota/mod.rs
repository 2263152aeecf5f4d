//! JS bundle 的 OTA 更新客户端

mod cache;
mod client;
mod host;
mod store;

pub use cache::{BundleCache, is_safe_version};
pub use client::{
    InstallMode, OtaClient, OtaConfig, OtaError, OtaState, OtaStatus, PendingUpdate,
    SyncOptions, SyncOutcome, SyncStatus,
};
pub use host::{AutoPrompter, HostRuntime, ProcessHost, Prompter, RestartChoice, StdinPrompter};
pub use store::KvStore;
