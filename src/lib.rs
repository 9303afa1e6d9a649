//! Keygroup program doctor: reads sampler keygroup programs in either format,
//! repairs root notes and key ranges, and rewrites them for a chosen firmware.

pub mod batch;
pub mod builder;
pub mod config;
pub mod error;
pub mod firmware;
pub mod key_range;
pub mod mapping;
pub mod note_inference;
pub mod note_name;
pub mod program;
pub mod program_xml;
pub mod rebuild;
pub mod relink;
pub mod repair;
pub mod spectral;
pub mod transpose;
pub mod wav;
