//! Shared types for the rating service

pub mod error;

pub use error::{RatingError, Result};
