pub mod aggregate;
pub mod annotate;
pub mod photo;
pub mod worker;
