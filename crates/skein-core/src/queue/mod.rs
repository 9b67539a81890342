//! Queue module: local priority queue, shared-store client, retry policy and
//! the task ledger.

mod ledger;
mod priority;
mod retry;
mod shared;

pub use ledger::TaskLedger;
pub use priority::PriorityTaskQueue;
pub use retry::RetryPolicy;
pub use shared::SharedQueueStore;
