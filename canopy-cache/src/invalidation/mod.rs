//! Write path: mutation fan-out and dispatch.

mod dispatcher;
mod graph;

pub use dispatcher::{InvalidationDispatcher, InvalidationReport};
pub use graph::InvalidationGraph;
