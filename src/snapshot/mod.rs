pub mod normalizer;
pub mod record;
