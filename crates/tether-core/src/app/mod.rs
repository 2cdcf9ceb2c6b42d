//! App - アプリケーション層
//!
//! ports を組み合わせて 1 回の起動（wrapper）と rollup を実装します。
//!
//! # 主要コンポーネント
//! - **Wrapper**: envelope mode（download → exec → upload → classify → report）
//! - **TransparentRunner**: transparent mode（stderr 転送 + exit code 書き換え）
//! - **EnvelopeBuilder / upload_outputs**: envelope の組み立てと output の upload
//! - **ResultReporter**: job tracker への提出と envelope の出力
//! - **ConcurrentRollup**: sub-resource の並列問い合わせと集約

pub mod builder;
pub mod exec;
pub mod reporter;
pub mod rollup;
pub mod wrapper;

// 主要な型を再エクスポート
pub use self::builder::{
    EnvelopeBuilder, UploadedOutputs, WRAPPER_VERSION, build_envelope, dump_debug_outputs,
    upload_outputs,
};
pub use self::exec::{Captured, StdoutMode, run_command};
pub use self::reporter::ResultReporter;
pub use self::rollup::ConcurrentRollup;
pub use self::wrapper::{Execution, TransparentRunner, Wrapper};
