//! Media probing, transcoding and stream containers

pub mod attachments;
pub mod media_info;
pub mod mediastream;
pub mod transcoder;
