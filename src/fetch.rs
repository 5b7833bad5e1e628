use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{error, info, warn};

use crate::error::MirrorError;

/// Hard cap on a single downloaded object. The advertised size may be absent
/// or wrong on the server, so the cap is enforced while streaming.
pub const MAX_DOWNLOAD_FILE_SIZE: u64 = 100 * 1024 * 1024 * 1024;

const DOWNLOAD_RETRY_INITIAL_WAIT_SECS: u64 = 10;
const MAX_DOWNLOAD_RETRY: u32 = 8;

// Some catalogues take minutes to generate server-side; the timeout has to
// outlast them.
const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Blocking client used for catalogue and dataset requests. Self-signed
/// certificates are accepted; TLS 1.2 and 1.3 are enabled.
pub fn open_http_client() -> Result<Client, MirrorError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("thredds-mirror/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| MirrorError::TransportHttp(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .connect_timeout(HTTP_CLIENT_TIMEOUT)
        .timeout(HTTP_CLIENT_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .build()
        .map_err(|err| MirrorError::TransportHttp(err.to_string()))
}

/// Wait before attempt `k` (k >= 2): 10, 20, 40, 80, ... seconds.
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(DOWNLOAD_RETRY_INITIAL_WAIT_SECS << (attempt.saturating_sub(2)))
}

/// Bring the bytes behind `uri` to `temp_file`. `file://` sources are copied
/// directly; HTTP sources go through the retry driver.
pub fn download_uri_to_file(uri: &str, temp_file: &Path) -> Result<(), MirrorError> {
    prepare_temp_file(temp_file)?;

    if let Some(path) = uri.strip_prefix("file://") {
        info!(source = uri, target = %temp_file.display(), "copying local file");
        fs::copy(path, temp_file).map_err(|err| {
            MirrorError::Filesystem(format!("copy {uri} to {}: {err}", temp_file.display()))
        })?;
        return Ok(());
    }

    download_http_uri_with_retry(uri, temp_file)
}

fn prepare_temp_file(temp_file: &Path) -> Result<(), MirrorError> {
    if temp_file.exists() {
        fs::remove_file(temp_file).map_err(|err| {
            MirrorError::Filesystem(format!(
                "temporary file {} already exists and can not be deleted: {err}",
                temp_file.display()
            ))
        })?;
    }
    if let Some(parent) = temp_file.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            MirrorError::Filesystem(format!(
                "can not create download directory {}: {err}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}

fn download_http_uri_with_retry(uri: &str, temp_file: &Path) -> Result<(), MirrorError> {
    let mut last_error = None;

    for attempt in 1..=MAX_DOWNLOAD_RETRY {
        if attempt > 1 {
            let wait = backoff(attempt);
            warn!(attempt, wait_secs = wait.as_secs(), "waiting before retry");
            std::thread::sleep(wait);
        }

        info!(source = uri, target = %temp_file.display(), attempt, "downloading");
        match download_http_attempt(uri, temp_file) {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(
                    attempt,
                    max = MAX_DOWNLOAD_RETRY,
                    error = %err,
                    "download attempt failed"
                );
                last_error = Some(err);
            }
        }
    }

    error!(source = uri, "download failed too many times, giving up");
    Err(last_error.unwrap_or_else(|| MirrorError::TransportHttp("no attempt was made".to_string())))
}

// A fresh client per attempt: dropping it tears down the connection, which
// is the reset the server sees between retries.
fn download_http_attempt(uri: &str, temp_file: &Path) -> Result<(), MirrorError> {
    let client = open_http_client()?;
    let response = client
        .get(uri)
        .send()
        .map_err(|err| MirrorError::TransportHttp(err.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(MirrorError::TransportStatus {
            status: status.as_u16(),
            url: uri.to_string(),
        });
    }

    let mut out = File::create(temp_file).map_err(|err| {
        MirrorError::Filesystem(format!("create {}: {err}", temp_file.display()))
    })?;
    binary_copy(response, &mut out, Some(MAX_DOWNLOAD_FILE_SIZE))?;
    Ok(())
}

/// Fixed-buffer copy with an optional byte cap. The advertised size may be
/// unknown on the server; streaming stops the moment the cap is crossed.
pub fn binary_copy<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    max_bytes: Option<u64>,
) -> Result<u64, MirrorError> {
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    let result = loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break Ok(total),
            Ok(read) => read,
            Err(err) => break Err(MirrorError::TransportHttp(err.to_string())),
        };
        total += read as u64;
        if let Some(max) = max_bytes {
            if total > max {
                break Err(MirrorError::SizeExceeded { max_bytes: max });
            }
        }
        if let Err(err) = writer.write_all(&buf[..read]) {
            break Err(MirrorError::Filesystem(err.to_string()));
        }
    };

    if let Err(err) = writer.flush() {
        error!(error = %err, "can not flush the output");
    }
    result
}
