pub mod client;
pub mod normalizer;
