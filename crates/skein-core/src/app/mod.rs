//! App - アプリケーション層
//!
//! ports / queue / typed / workflow を組み合わせて manager を構成します。
//!
//! # 主要コンポーネント
//! - **ManagerBuilder**: 構築とワイヤリング、起動時検証
//! - **TaskQueueManager**: submit / worker / workflow / health の facade
//! - **TaskWorker**: タスク実行ループ（dequeue→lock→execute→retry→publish）
//! - **status**: health / stats のビュー

pub mod builder;
pub mod manager;
pub mod status;
pub mod worker;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, ManagerBuilder};
pub use self::manager::{TaskQueueManager, TaskRequest};
pub use self::status::{HealthReport, HealthStatus, ManagerStats, StepView, WorkflowStatusView};
pub use self::worker::{TaskSource, TaskWorker, WorkerHandle, WorkerStatsView};
