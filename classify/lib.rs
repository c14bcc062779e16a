#![deny(dead_code)]
#![deny(unused_imports)]

pub mod data;
pub mod design;
pub mod estimate;
pub mod evaluate;
pub mod model;
pub mod objective;
pub mod optimize;
pub mod progress;
