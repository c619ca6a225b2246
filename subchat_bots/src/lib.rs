pub mod data;
pub mod model;
pub mod subtitles;
pub mod train;
