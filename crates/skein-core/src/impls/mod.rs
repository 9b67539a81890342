//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryBackend**: SharedBackend の 1 プロセス内実装
//!
//! 本番用の実装（Redis など）は別クレートに配置します。

pub mod inmem_backend;

pub use self::inmem_backend::InMemoryBackend;
