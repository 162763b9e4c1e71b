pub mod annotation;
pub mod block;
pub mod block_analyzer;
pub mod detected_object;
pub mod image_analyzer;
pub mod smoothing;
pub mod statistics_table;
