pub mod buf_ext;
pub mod recency_set;
