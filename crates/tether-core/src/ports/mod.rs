//! Ports - 抽象化レイヤー
//!
//! 外部システム（blob service, job tracker, sub-resource の参照元）への
//! インターフェースを trait として定義します。実装は `impls` にあります。

pub mod blob_store;
pub mod clock;
pub mod job_tracker;
pub mod sub_resource;

pub use self::blob_store::{BlobStore, DownloadStream, UploadStream};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::job_tracker::JobTracker;
pub use self::sub_resource::SubResourceSource;
