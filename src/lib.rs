pub mod core;
pub mod streaming;

pub use crate::core::{
    config::{ClientConfig, StreamingConfig},
    errors::StreamError,
    types::*,
};
pub use streaming::{StreamStatistics, StreamingService};
