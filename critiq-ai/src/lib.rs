//! # Critiq AI
//!
//! Tri-state classification of course posts with benchmarking and a
//! statistical gate, context-level clustering of accepted criticisms, and
//! cross-context normalization onto a versioned taxonomy. Every stage
//! writes a run directory described by a hashed manifest.

pub mod benchmark;
pub mod classify;
pub mod cluster;
pub mod gate;
pub mod normalize;
pub mod parse;
pub mod prompt;
pub mod run;
pub mod sampler;
pub mod service;
pub mod stages;
