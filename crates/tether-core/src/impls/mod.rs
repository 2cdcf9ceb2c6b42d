//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryBlobStore / InMemoryJobTracker**: 開発用・テスト用
//! - **RemoteClient / HttpBlobStore / HttpJobTracker**: 本番用（HTTP）
//! - **CommandSource**: 外部コマンドで sub-resource を参照する SubResourceSource

pub mod command_source;
pub mod http_remote;
pub mod inmem_blobs;
pub mod inmem_jobs;

pub use self::command_source::CommandSource;
pub use self::http_remote::{HttpBlobStore, HttpJobTracker, RemoteClient};
pub use self::inmem_blobs::InMemoryBlobStore;
pub use self::inmem_jobs::InMemoryJobTracker;
