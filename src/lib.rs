pub mod api;
pub mod download;
pub mod jobs;
pub mod media;
pub mod progress_bar;
