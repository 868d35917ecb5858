#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod radio;

// Hardware glue only builds against the ESP32-S3 stack
#[cfg(feature = "embedded")]
pub mod hal;
#[cfg(feature = "embedded")]
pub mod logger;
