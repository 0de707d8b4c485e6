pub mod error;
pub mod block;
pub mod btree;
pub mod clock;
pub mod conf;
pub mod engine;
pub mod large;
pub mod metrics;
pub mod oper;
pub mod slice;
pub mod thread;
pub mod trx;

pub mod prelude {
    pub use crate::btree::{GetValue, TreeStats};
    pub use crate::conf::{EngineConfig, SliceConfig};
    pub use crate::engine::Engine;
    pub use crate::error::*;
    pub use crate::oper::*;
    pub use crate::slice::Slice;
}
