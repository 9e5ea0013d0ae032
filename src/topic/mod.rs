//! Topic name and filter checks applied before anything is queued

mod validation;

pub use validation::{has_wildcards, validate_topic_filter, validate_topic_name};
