/*!
 * Worker Module
 * Runtime embedded in each supervised worker process
 */

mod behavior;
mod runtime;

pub use behavior::{IdleBehavior, WorkerBehavior};
pub use runtime::WorkerRuntime;
