//! Ports - 抽象化レイヤー
//!
//! 外部システム（共有ストア、時刻、ID 生成）へのインターフェースを定義し、
//! 実装の詳細を隠蔽します。テストでは InMemoryBackend / FixedClock に差し替えます。

pub mod clock;
pub mod id_generator;
pub mod shared_backend;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::shared_backend::SharedBackend;
