//! Event handlers and the delegation front door.

pub mod checkpoint;
pub mod delegation;
pub mod dependency;
pub mod logs;

pub use delegation::{DelegateRequest, DelegationService, ResumeChain};
