//! Copy-on-write B-tree over the block layer.
//!
//! Keys are ordered byte strings of bounded length. Every leaf entry
//! carries a value, which is inline or a reference to a large value
//! object, and the time it was written.
pub mod get;
pub mod internal;
pub mod key;
pub mod leaf;
pub mod modify;
pub mod node;
pub mod value;
pub mod verify;

pub use get::{depth, get, GetValue};
pub use key::{BTreeKey, MAX_KEY_SIZE};
pub use modify::modify;
pub use node::{Node, NodeLimits};
pub use value::{BTreeValue, ValueData, MAX_IN_NODE_VALUE_SIZE};
pub use verify::{verify, TreeStats};

use crate::clock::{CasGenerator, Clock};
use crate::metrics::DepthGauge;

/// Collaborators shared by all mutations of one tree.
pub struct TreeContext<'a> {
    pub clock: &'a dyn Clock,
    pub cas: &'a CasGenerator,
    pub depth: &'a DepthGauge,
}
