//! General-purpose execution runtime

pub mod executor;

pub use executor::{TaskHandle, TaskPanic, TaskPriority, WorkStealingPool};
