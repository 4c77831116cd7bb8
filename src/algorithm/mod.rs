//! Algorithm implementations
//!
//! This module contains the matched-set construction and refinement engine.

pub mod matching;
