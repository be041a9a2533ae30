pub mod index;
pub mod notes;
pub mod parser;
pub mod reconciler;
pub mod vault;
