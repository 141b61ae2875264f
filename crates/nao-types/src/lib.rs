pub mod errors;
pub mod hparams;
pub mod net_code;
pub mod search_space;
pub mod task;

pub use errors::*;
pub use hparams::*;
pub use net_code::*;
pub use search_space::*;
pub use task::*;
