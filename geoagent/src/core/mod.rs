//! Pure, deterministic logic. No filesystem, process or network access.

pub mod extract;
pub mod run;
pub mod similarity;
pub mod transcript;
pub mod transitions;
pub mod types;
pub mod validation;
