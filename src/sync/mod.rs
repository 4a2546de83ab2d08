pub mod engine;
pub mod types;

pub use engine::ReplayEngine;
pub use types::*;
