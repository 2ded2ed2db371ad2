pub mod backup;
pub mod classes;
pub mod core;
pub mod reports;
pub mod schools;
pub mod scores;
pub mod students;
pub mod subjects;
