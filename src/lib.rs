//! People counting over sampled media frames.
//!
//! This library provides the core of the headcount system: a bounded
//! background job scheduler, a frame sampler, a centroid identity tracker,
//! and the analysis pipeline that ties them to a detection backend.

pub mod config;
pub mod models;
pub mod services;
