pub mod actions;
pub mod events;
pub mod policies;
pub mod predict;
