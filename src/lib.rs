// Library exports for the ISSL off-target index and scoring engine.
pub mod bitset;
pub mod error;
pub mod extractor;
pub mod index_builder;
pub mod index_format;
pub mod index_reader;
pub mod penalties;
pub mod scoring;
pub mod signature;
pub mod slice;
pub mod timing;
