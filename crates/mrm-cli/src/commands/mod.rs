//! Command implementations for the mrm CLI

pub mod config;
pub mod profile;
pub mod simulate;
