pub mod lab;
pub mod schedule;
