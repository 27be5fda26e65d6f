pub mod core;
pub mod groups;
pub mod persons;
pub mod reports;
pub mod school;
pub mod setup;
pub mod timetable_import;
