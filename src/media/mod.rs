pub mod mimetype;
pub mod resize;
