pub mod buf;
pub mod latch;
