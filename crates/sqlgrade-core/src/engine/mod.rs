pub mod executor;
pub mod statement;

pub use executor::execute;
