pub mod credits;
pub mod optimize;
