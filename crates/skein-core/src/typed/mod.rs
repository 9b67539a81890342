//! Typed - handler と registry
//!
//! # 二層構造
//! - **表層（Typed）**: `TypedTask` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `TaskHandler` trait - object-safe, type erasure
//!
//! closure 版 (`FnHandler`, `BlockingFnHandler`) も同じ `TaskHandler` に揃えます。

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{
    BlockingFnHandler, FnHandler, Handler, HandlerError, TaskHandler, TypedHandler,
};
pub use self::registry::TaskRegistry;
pub use self::task::TypedTask;
