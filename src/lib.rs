//! Summarizes long recordings with a generative model by cutting them into
//! overlapping windows, summarizing each window remotely, and stitching the
//! results into one document.

pub mod config;
pub mod error;
pub mod gemini;
pub mod media;
pub mod pipeline;
pub mod planner;
pub mod remote;
pub mod retry;
pub mod synthesis;

#[cfg(test)]
mod testing;
