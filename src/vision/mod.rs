//! Vision/OCR Layer
//!
//! Turns a photograph of an IC package into text readings:
//! - preprocessing into several image variants
//! - external OCR engines run over every variant

pub mod ocr;
pub mod preprocess;

pub use ocr::{engines_from_config, load_readings, run_engines, OcrEngine, OcrError, OcrReading};
pub use preprocess::{generate_variants, load_image, write_variants, ImageVariant, VariantKind};
