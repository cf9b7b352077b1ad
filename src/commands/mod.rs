pub mod top_level;
