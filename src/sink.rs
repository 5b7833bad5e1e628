use std::fs;
use std::path::{Path, PathBuf};

use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::definition::OutputType;
use crate::error::MirrorError;

/// Objects above this size go through a multipart upload.
const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
const MULTIPART_PART_SIZE: u64 = 16 * 1024 * 1024;

/// The mirror destination. One interface, two strategies: a local filesystem
/// move or an object-store upload.
pub trait Sink {
    /// Make the downloaded file visible at its final destination URI.
    fn publish(&self, local_file: &Path, dest_uri: &str) -> Result<(), MirrorError>;

    /// Probe the destination for an existing object.
    fn exists(&self, dest_uri: &str) -> Result<bool, MirrorError>;
}

pub fn sink_for(output_type: OutputType) -> Result<Box<dyn Sink>, MirrorError> {
    match output_type {
        OutputType::File => Ok(Box::new(FileSink)),
        OutputType::S3 => Ok(Box::new(S3Sink::new()?)),
    }
}

// ---------------------------------------------------------------------------
// Local filesystem

pub struct FileSink;

fn file_uri_to_path(dest_uri: &str) -> Result<PathBuf, MirrorError> {
    let path = dest_uri
        .strip_prefix("file://")
        .ok_or_else(|| MirrorError::InvalidUri(dest_uri.to_string()))?;
    if path.is_empty() {
        return Err(MirrorError::InvalidUri(dest_uri.to_string()));
    }
    Ok(PathBuf::from(path))
}

impl Sink for FileSink {
    fn publish(&self, local_file: &Path, dest_uri: &str) -> Result<(), MirrorError> {
        let destination = file_uri_to_path(dest_uri)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| MirrorError::Sink(format!("create {}: {err}", parent.display())))?;
        }
        if fs::rename(local_file, &destination).is_ok() {
            return Ok(());
        }
        // The download directory may live on a different filesystem than the
        // destination; rename can not cross that boundary.
        fs::copy(local_file, &destination).map_err(|err| {
            MirrorError::Sink(format!(
                "copy {} to {}: {err}",
                local_file.display(),
                destination.display()
            ))
        })?;
        fs::remove_file(local_file)
            .map_err(|err| MirrorError::Sink(format!("remove {}: {err}", local_file.display())))?;
        Ok(())
    }

    fn exists(&self, dest_uri: &str) -> Result<bool, MirrorError> {
        Ok(file_uri_to_path(dest_uri)?.exists())
    }
}

// ---------------------------------------------------------------------------
// Object store

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Uri {
    pub bucket: String,
    pub key: String,
}

impl S3Uri {
    pub fn parse(uri: &str) -> Result<Self, MirrorError> {
        let rest = uri
            .strip_prefix("s3://")
            .ok_or_else(|| MirrorError::InvalidUri(uri.to_string()))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| MirrorError::InvalidUri(uri.to_string()))?;
        if bucket.is_empty() || key.is_empty() {
            return Err(MirrorError::InvalidUri(uri.to_string()));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

/// Object-store sink. The rest of the crate is blocking, so the SDK calls
/// run on a private current-thread runtime.
pub struct S3Sink {
    runtime: tokio::runtime::Runtime,
    client: Client,
}

impl S3Sink {
    pub fn new() -> Result<Self, MirrorError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| MirrorError::Sink(err.to_string()))?;
        let client = runtime.block_on(async {
            let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
            Client::new(&config)
        });
        Ok(Self { runtime, client })
    }

    fn upload_whole(&self, local_file: &Path, uri: &S3Uri) -> Result<(), MirrorError> {
        self.runtime.block_on(async {
            let body = ByteStream::from_path(local_file)
                .await
                .map_err(|err| MirrorError::Sink(err.to_string()))?;
            self.client
                .put_object()
                .bucket(&uri.bucket)
                .key(&uri.key)
                .body(body)
                .send()
                .await
                .map_err(|err| MirrorError::Sink(err.to_string()))?;
            Ok(())
        })
    }

    fn upload_multipart(&self, local_file: &Path, uri: &S3Uri, size: u64) -> Result<(), MirrorError> {
        self.runtime.block_on(async {
            let upload = self
                .client
                .create_multipart_upload()
                .bucket(&uri.bucket)
                .key(&uri.key)
                .send()
                .await
                .map_err(|err| MirrorError::Sink(err.to_string()))?;
            let upload_id = upload
                .upload_id()
                .ok_or_else(|| MirrorError::Sink("multipart upload id missing".to_string()))?
                .to_string();

            match self.upload_parts(local_file, uri, &upload_id, size).await {
                Ok(parts) => {
                    self.client
                        .complete_multipart_upload()
                        .bucket(&uri.bucket)
                        .key(&uri.key)
                        .upload_id(&upload_id)
                        .multipart_upload(
                            CompletedMultipartUpload::builder()
                                .set_parts(Some(parts))
                                .build(),
                        )
                        .send()
                        .await
                        .map_err(|err| MirrorError::Sink(err.to_string()))?;
                    Ok(())
                }
                Err(err) => {
                    let _ = self
                        .client
                        .abort_multipart_upload()
                        .bucket(&uri.bucket)
                        .key(&uri.key)
                        .upload_id(&upload_id)
                        .send()
                        .await;
                    Err(err)
                }
            }
        })
    }

    async fn upload_parts(
        &self,
        local_file: &Path,
        uri: &S3Uri,
        upload_id: &str,
        size: u64,
    ) -> Result<Vec<CompletedPart>, MirrorError> {
        use std::io::Read;

        let mut file = fs::File::open(local_file)
            .map_err(|err| MirrorError::Sink(format!("open {}: {err}", local_file.display())))?;
        let mut parts = Vec::new();
        let mut remaining = size;
        let mut part_number: i32 = 1;

        while remaining > 0 {
            let length = MULTIPART_PART_SIZE.min(remaining) as usize;
            let mut chunk = vec![0u8; length];
            file.read_exact(&mut chunk)
                .map_err(|err| MirrorError::Sink(err.to_string()))?;
            let part = self
                .client
                .upload_part()
                .bucket(&uri.bucket)
                .key(&uri.key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|err| MirrorError::Sink(err.to_string()))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .build(),
            );
            debug!(part_number, length, "uploaded part");
            remaining -= length as u64;
            part_number += 1;
        }

        Ok(parts)
    }
}

impl Sink for S3Sink {
    fn publish(&self, local_file: &Path, dest_uri: &str) -> Result<(), MirrorError> {
        let uri = S3Uri::parse(dest_uri)?;
        let size = fs::metadata(local_file)
            .map_err(|err| MirrorError::Sink(err.to_string()))?
            .len();
        info!(source = %local_file.display(), destination = dest_uri, size, "uploading");
        if size > MULTIPART_THRESHOLD {
            self.upload_multipart(local_file, &uri, size)
        } else {
            self.upload_whole(local_file, &uri)
        }
    }

    fn exists(&self, dest_uri: &str) -> Result<bool, MirrorError> {
        let uri = S3Uri::parse(dest_uri)?;
        self.runtime.block_on(async {
            match self
                .client
                .head_object()
                .bucket(&uri.bucket)
                .key(&uri.key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(err) => {
                    let service_err = err.into_service_error();
                    if service_err.is_not_found() {
                        Ok(false)
                    } else {
                        Err(MirrorError::Sink(service_err.to_string()))
                    }
                }
            }
        })
    }
}
