// Medien-Inspektion ohne Encoder.

pub mod metadata;

pub use metadata::{codec_label, MediaMetadata, MetadataExtractor};
