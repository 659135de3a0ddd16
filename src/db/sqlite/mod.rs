mod common;
mod exposures;

pub use exposures::SqliteExposureRepo;
