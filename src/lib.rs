#![doc = include_str!("../README.md")]

pub mod firestore;
pub mod platform;
pub mod util;
