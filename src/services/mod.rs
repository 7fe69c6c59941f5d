pub mod detector;
pub mod media;
pub mod pipeline;
pub mod sampler;
pub mod scheduler;
pub mod tracker;
