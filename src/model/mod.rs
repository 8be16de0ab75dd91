pub mod attention;
pub mod builder;
pub mod llama;
pub mod loss;
pub mod ops;
pub mod rope;

pub use llama::{ModelArgs, Transformer};
pub use loss::{cross_entropy_loss, LossReduction};
