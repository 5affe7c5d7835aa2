pub mod backup_exchange;
pub mod bulletin;
pub mod classes;
pub mod core;
pub mod curriculum;
pub mod grades;
pub mod students;
