pub mod assignments;
pub mod catalog;
pub mod core;
pub mod feedback;
pub mod identity;
pub mod reports;
