//! Domain model module declarations.

pub mod alert;
pub mod execution;
pub mod phase;
pub mod pipeline;
pub mod schedule;
pub mod work_item;
