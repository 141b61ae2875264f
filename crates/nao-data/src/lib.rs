pub mod batching;
pub mod dataset;
pub mod dictionary;
pub mod tokenizer;

pub use batching::*;
pub use dataset::*;
pub use dictionary::*;
pub use tokenizer::*;
