pub mod http;
pub mod postprocess;
pub mod registry;
pub mod ytdlp;
