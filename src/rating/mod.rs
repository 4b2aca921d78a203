//! Rating engine
//!
//! - **formula**: aggregate counters to score
//! - **resolver**: author identity to account
//! - **burst**: per-account debounce
//! - **flush**: batched persistence and live notification
//! - **calculator**: per-workspace migration and incremental processing
//! - **lifecycle**: drain-then-close wrapper around a calculator

pub mod burst;
pub mod cache;
pub mod calculator;
pub mod flush;
pub mod formula;
pub mod lifecycle;
pub mod resolver;

pub use burst::BurstLimiter;
pub use cache::{AggregateCache, ParentCache};
pub use calculator::{CalculatorConfig, CalculatorDeps, CalculatorState, RatingCalculator};
pub use flush::FlushCoordinator;
pub use lifecycle::CalculatorHandle;
pub use resolver::PersonResolver;
