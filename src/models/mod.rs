pub mod analysis;
pub mod detection;
pub mod job;
