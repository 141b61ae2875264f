//! Numeric core of the architecture search: the shared weight store, child
//! networks built from net codes, training collaborators and the
//! encoder-predictor-decoder controller.

pub mod bleu;
pub mod child;
pub mod controller;
pub mod criterion;
pub mod epd;
pub mod optim;
pub mod seq;
pub mod shared;

pub use bleu::*;
pub use child::*;
pub use controller::*;
pub use criterion::*;
pub use epd::*;
pub use optim::*;
pub use seq::*;
pub use shared::*;
