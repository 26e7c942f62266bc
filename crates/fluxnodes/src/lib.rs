//! Built-in node catalogue.
//!
//! A small set of general-purpose nodes so a deployment has something to
//! execute out of the box. Custom node types register through the same
//! [`fluxruntime::NodeFactory`] seam.

mod debug;
mod time;
mod transform;

pub use debug::DebugNode;
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode};

use fluxruntime::NodeRegistry;
use std::sync::Arc;

/// Register every built-in node type
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(debug::DebugNodeFactory));
    registry.register(Arc::new(transform::JsonParseNodeFactory));
    registry.register(Arc::new(transform::JsonStringifyNodeFactory));
    registry.register(Arc::new(time::DelayNodeFactory));
}
