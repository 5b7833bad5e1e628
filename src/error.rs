use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MirrorError {
    #[error("invalid download definition {id}: {message}")]
    InvalidDefinition { id: String, message: String },

    #[error("download definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("there is no active download definition")]
    NoActiveDefinitions,

    #[error("no suitable catalogue URL found for download definition {0}")]
    NoCatalogue(String),

    #[error("failed to parse THREDDS catalogue {url}: {message}")]
    CatalogueParse { url: String, message: String },

    #[error("catalogue request failed: {0}")]
    CatalogueHttp(String),

    #[error("download request failed: {0}")]
    TransportHttp(String),

    #[error("server returned status {status} for {url}")]
    TransportStatus { status: u16, url: String },

    #[error("download exceeded the maximum allowed size of {max_bytes} bytes")]
    SizeExceeded { max_bytes: u64 },

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("dataset scan failed: {0}")]
    Scan(String),

    #[error("notification failed: {0}")]
    Notify(String),

    #[error("unable to determine free space for {0}")]
    SpaceProbe(String),
}
