pub mod blob_id;
pub mod content_id;
pub mod error;

pub use blob_id::{BlobId, BlobMetadata};
pub use content_id::ContentId;
pub use error::{Result, StrataError};
