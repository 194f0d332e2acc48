pub mod collaborators;
pub mod core;
pub mod error;
pub mod manager;
pub mod models;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod session;
pub mod store;
pub mod task;

pub use collaborators::{
    AlwaysOnline, Connectivity, ConnectivityFlag, DirectResolver, MediaResolver, source_id_for,
};
pub use self::core::{Transfer, TransferClient, TransferProgress, TransferRequest, TransferSummary};
pub use error::{DownloadError, Result};
pub use manager::DownloadManager;
pub use models::{FormatDescriptor, MediaDescriptor, ProgressUpdate, TaskFilter, TaskSnapshot};
pub use progress::{ProgressEvent, ProgressStream};
pub use retry::RetryPolicy;
pub use store::{DownloadStore, JsonFileStore, MemoryStore};
pub use task::{DownloadTask, TaskStatus};
