//! skein-core
//!
//! In-process task queue with optional distributed execution.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, result, errors）
//! - **ports**: 抽象化レイヤー（SharedBackend, Clock, IdGenerator）
//! - **impls**: ports の実装（InMemoryBackend）
//! - **queue**: ローカル優先度キュー、shared store クライアント、retry、ledger
//! - **typed**: handler と registry（closure / 型付き Task）
//! - **workflow**: 依存グラフと段階実行
//! - **app**: manager, worker, builder, status
//! - **config**: TOML 設定
//! - **observability**: tracing 初期化と集計

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod typed;
pub mod workflow;

pub use app::{ManagerBuilder, TaskQueueManager, TaskRequest};
pub use config::ManagerConfig;
pub use domain::{SkeinError, TaskConfig, TaskId, TaskPriority, TaskResult, TaskStatus};
