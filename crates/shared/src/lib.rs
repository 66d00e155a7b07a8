pub mod domain;
pub mod error;
pub mod preferences;
pub mod protocol;
