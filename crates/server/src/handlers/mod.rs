//! HTTP request handlers.

pub mod common;
pub mod completion;
pub mod routing;
pub mod tus;

pub use common::*;
pub use completion::*;
pub use routing::*;
pub use tus::*;
