//! tether-core
//!
//! Building blocks for the tether command wrapper.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, descriptor, outcome, classifier, envelope, external, errors）
//! - **ports**: 抽象化レイヤー（BlobStore, JobTracker, SubResourceSource, Clock）
//! - **transfer**: chunked transfer（upload / download）
//! - **app**: アプリケーションロジック（wrapper, reporter, rollup）
//! - **impls**: 実装（HTTP remote、in-memory、外部コマンド）
//! - **config**: 起動ごとの設定

pub mod config;
pub mod domain;
pub mod ports;
pub mod transfer;
pub mod app;
pub mod impls;
