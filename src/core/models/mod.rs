pub mod credits;
pub mod usage;
