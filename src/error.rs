use crate::transport::HttpError;

/// Errors that occurred while preparing or sending a capture request.
///
/// These never propagate to `capture()` callers. The transport layer handles
/// them locally (retry queue, error hook, logs); the enum exists so internal
/// layers can report precisely what went wrong.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An event payload failed to serialize to JSON. Delivery of the affected
    /// batch failed because of this.
    ///
    /// Note: This is an error in this crate. If you spot this, please open an
    /// issue.
    #[error("serializing request payload failed with {0}")]
    EncodeRequest(serde_json::Error),

    /// A request payload failed to compress. Delivery of the affected batch
    /// failed because of this.
    ///
    /// Note: This is an error in this crate. If you spot this, please open an
    /// issue.
    #[error("compressing request payload failed with {0}")]
    CompressRequest(std::io::Error),

    /// The ingestion endpoint answered 200 but the body was not valid JSON.
    ///
    /// Delivery may have worked. But since we could not look into the
    /// response, we can't be sure.
    #[error("deserializing response failed with {0}")]
    DeserializeResponse(serde_json::Error),

    /// Could not complete the HTTP request to the ingestion endpoint.
    #[error("sending request failed with {0}")]
    Connection(HttpError),
}
