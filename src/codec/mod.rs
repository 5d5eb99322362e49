pub mod frame;
pub mod parser;
mod errors;
