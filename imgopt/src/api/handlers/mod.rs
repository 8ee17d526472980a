pub mod credits;
pub mod health;
pub mod optimize;
