//! Dispatcher tests: scenarios, thread races, background mode and properties.

#![allow(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    clippy::as_conversions,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

mod scenario;
mod test_helpers;
