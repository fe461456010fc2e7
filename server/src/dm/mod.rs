pub mod blocks;
pub mod messages;
