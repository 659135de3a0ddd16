mod exposure;

pub use exposure::*;
