//! H.264 handling shared by capture and the relay transport

pub mod nal;

pub use nal::{encode_length_prefixed, AccessUnit, NalReader, NalType, NalUnitCodec, ParameterSets};
