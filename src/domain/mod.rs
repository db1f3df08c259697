pub mod asset;
pub mod instance;
pub mod plan;
pub mod result;
pub mod summary_store;
