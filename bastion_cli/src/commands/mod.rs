pub mod blocks;
pub mod login;
pub mod stats;
