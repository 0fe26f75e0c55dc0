//! Forward noising schedule and reverse-process sampling.

pub mod sampler;
pub mod schedule;

pub use sampler::Sampler;
pub use schedule::NoiseSchedule;
