pub mod engine;
pub mod pool;
pub mod queue;
pub mod types;


pub use engine::*;
pub use pool::*;
pub use queue::*;
pub use types::*;
