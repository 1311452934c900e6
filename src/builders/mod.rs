//! Builders to construct a lab from configuration.

pub mod lab_builder;

pub use lab_builder::{build_lab, build_lab_with, open_collection, LabParts};
