//! Domain models - core types shared by every execution context
//!
//! This module contains the canonical data types used throughout the system:
//! - `DomainEvent` - normalized event delivered to subscribers
//! - `ClassificationSample` - one classifier result
//! - `PoleMapping` - static LED channel to pole id table

pub mod poles;
pub mod types;

pub use poles::PoleMapping;
pub use types::{epoch_ms, ClassificationSample, DomainEvent, PoleState};
