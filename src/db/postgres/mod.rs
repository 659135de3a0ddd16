mod exposures;

pub use exposures::PostgresExposureRepo;
