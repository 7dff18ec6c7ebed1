#![forbid(unsafe_code)]

pub mod demo;

pub use demo::DemoSource;
