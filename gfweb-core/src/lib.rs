mod client;
mod ndjson;

pub use client::{
    ApiError, ArchiveCommand, ArchiveRequest, DirEntry, GfwebClient, UploadMeta, encode_path,
};
pub use ndjson::{
    ArchiveMember, ArchiveMemberKind, LineBuffer, NdjsonDecoder, StreamRecord, ZipEvent,
    parse_listing_line, parse_record, parse_sse_line,
};
