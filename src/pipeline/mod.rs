pub mod categorize;
pub mod load;
pub mod normalize;
pub mod parser;
pub mod runner;
pub mod snapshot;
