//! Protocol module - DFU image container definitions.

pub mod constants;
pub mod header;
pub mod image;

pub use constants::*;
pub use header::{
    HeaderError, PartitionHeader, SectionKind, SectionPrefix, UpgradeHeader, Version,
    variant_tag, variant_to_string,
};
pub use image::{ImageBuilder, ImageLayout, PartitionImage, SectionInfo};
