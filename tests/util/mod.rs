#![allow(dead_code)]

pub mod test_address;
pub mod test_chain;
