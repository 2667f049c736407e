pub mod layout;
pub mod resize;
