pub mod controller;
pub mod daemon;
pub mod isbsvc;
pub mod processor;
#[cfg(test)]
mod processor_test;
pub mod udf;
