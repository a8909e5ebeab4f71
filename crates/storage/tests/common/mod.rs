pub mod mocks;

#[allow(unused_imports)]
pub use mocks::{FailureKind, FlakyStore};
