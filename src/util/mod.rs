//! Shared utilities: aligned buffers, timing helpers, CPU accounting

pub mod buffer;
pub mod cpu;
pub mod time;
