//! pricebeacon library — price-scraping pipeline and Discord reconcile loop.
//!
//! This library crate exposes the core modules for integration testing.

pub mod config;
pub mod discord;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod price;
pub mod provision;
pub mod reconcile;
pub mod webdriver;
