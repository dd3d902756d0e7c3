//! Fragmented MP4 (ISO/IEC 14496-12) muxing for a single live H.264 track.
//!
//! Only the boxes a live fMP4 consumer needs are produced. The sample
//! tables in `stbl` are present but empty; all sample data lives in the
//! per-sample `moof`/`mdat` fragments.

mod boxes;
mod muxer;
mod stream;

pub use boxes::{BOX_HEADER_LEN, FourCc, Mp4Box, split_boxes};
pub use muxer::{Mp4Muxer, TRACK_ID};
pub use stream::Fmp4Stream;

/// MIME type of the byte stream produced by [`Fmp4Stream`].
pub const CONTENT_TYPE: &str = "video/mp4";
