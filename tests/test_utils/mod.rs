#![allow(dead_code)]

pub mod collector;
pub mod fixtures;
pub mod sink;

pub use collector::{Collector, CollectorOptions};
pub use sink::HeldSink;
