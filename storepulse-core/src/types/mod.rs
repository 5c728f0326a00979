pub mod extension;
pub mod ids;

pub use extension::*;
pub use ids::*;
