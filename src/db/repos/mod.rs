pub mod cursor;
mod exposures;

pub use cursor::*;
pub use exposures::*;
