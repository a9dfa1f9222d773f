//! Numeric kernels used by the reference PaliGemma decoder and the samplers.

pub mod attention;
pub mod norm;
pub mod utils;

pub use attention::*;
pub use norm::*;
pub use utils::*;
