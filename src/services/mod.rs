pub mod aggregation;
pub mod calculator;
pub mod consensus;
pub mod interpolation;
pub mod location;
pub mod locations;
pub mod members;
pub mod naefs;
pub mod source;
