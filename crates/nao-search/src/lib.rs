//! The NAO search loop: architecture pool, child training and evaluation,
//! controller retraining and generation, and pool persistence.

pub mod env;
pub mod generator;
pub mod meters;
pub mod persistence;
pub mod pool;
pub mod progress;
pub mod search;
pub mod trainer;

pub use env::*;
pub use generator::*;
pub use meters::*;
pub use persistence::*;
pub use pool::*;
pub use progress::*;
pub use search::*;
pub use trainer::*;
