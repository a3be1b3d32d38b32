pub mod ast;
pub mod grammar;
pub mod compiler;
pub mod cache;
