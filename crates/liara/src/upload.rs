//! # Source upload
//!
//! The archive is streamed from disk straight into the multipart request body.
//! Every chunk read from the file updates a [`watch`] channel, which is used to
//! report transfer progress while the request is in flight.

use std::{io, path::Path};

use derive_more::{Display, Error, From};
use futures_util::TryStreamExt;
use reqwest::Body;
use tokio::{fs::File, sync::watch};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{
    api::{ApiClient, ApiError},
    reporter::Reporter,
};

/// Source upload errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum UploadError {
    /// Unable to read the archive.
    Io(io::Error),

    /// Upload request failed.
    Api(ApiError),
}

/// Upload the archive located at `archive` as a source bundle of `app`.
///
/// Returns the identifier of the stored bundle.
pub(crate) async fn upload(
    api: &ApiClient,
    app: &str,
    archive: &Path,
    reporter: &dyn Reporter,
) -> Result<String, UploadError> {
    let file = File::open(archive).await?;
    let total = file.metadata().await?.len();

    let (sender, mut receiver) = watch::channel(0);
    let mut transferred = 0;

    let stream = ReaderStream::new(file).inspect_ok(move |chunk| {
        transferred += chunk.len() as u64;
        sender.send_replace(transferred);
    });

    reporter.phase("Uploading...");
    debug!(total, "uploading source bundle");

    let request = api.upload_source(app, Body::wrap_stream(stream), total);
    tokio::pin!(request);

    let source_id = loop {
        tokio::select! {
            result = &mut request => break result?,
            changed = receiver.changed() => match changed {
                Ok(()) => reporter.progress(*receiver.borrow_and_update(), total),
                Err(_) => break (&mut request).await?,
            },
        }
    };

    reporter.progress(total, total);

    Ok(source_id)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::NamedTempFile;

    use super::upload;
    use crate::{
        api::ApiClient,
        testing::{MockPlatform, RecordingReporter},
    };

    #[tokio::test]
    async fn streams_archive() {
        let platform = MockPlatform::start().await;
        let api = ApiClient::new(&platform.url, "token");
        let reporter = RecordingReporter::default();

        let contents: Vec<u8> = (0..200_000u32).map(|value| value as u8).collect();
        let archive = NamedTempFile::new().unwrap();
        fs::write(archive.path(), &contents).unwrap();

        let source_id = upload(&api, "app", archive.path(), &reporter)
            .await
            .unwrap();

        assert_eq!(source_id, "source-1");
        assert_eq!(platform.state().uploads, [contents]);
        assert_eq!(reporter.phases.borrow().as_slice(), ["Uploading..."]);
        assert_eq!(
            reporter.progress.borrow().last(),
            Some(&(200_000, 200_000))
        );
        assert!(reporter
            .progress
            .borrow()
            .windows(2)
            .all(|pair| pair[0].0 <= pair[1].0));
    }
}
