//! RPCs the broker initiates toward a provider

use crate::error::{Error, Result};
use crate::provider::session::Provider;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wharf_core::StoredFile;
use wharf_protocol::{
    File, FileListingRequest, FileListingResponse, FileProbeRequest, FileProbeResponse,
    FileUploadRequest, FileUploadResponse, TaskRequest, TaskResponse,
};

impl Provider {
    /// Execute a task on this provider without touching the limiter. The
    /// submission loop guards its own permits; `run`/`try_run` are for
    /// direct callers.
    pub(crate) async fn execute(
        &self,
        token: &CancellationToken,
        request: &TaskRequest,
    ) -> Result<TaskResponse> {
        debug!(task = %request.task_id(), addr = %self.addr(), "scheduled >>");
        let response = self.messenger().request_sync(token, request).await?;
        debug!(task = %request.task_id(), addr = %self.addr(), "finished  <<");
        Ok(response)
    }

    /// Run a task synchronously, waiting for a free permit first.
    pub async fn run(
        &self,
        token: &CancellationToken,
        request: &TaskRequest,
    ) -> Result<TaskResponse> {
        self.limiter()
            .acquire(1, token)
            .await
            .map_err(|_| Error::Cancelled("run aborted".to_string()))?;
        let result = self.execute(token, request).await;
        self.limiter().release(1);
        result
    }

    /// Run a task only if the provider has free capacity right now.
    pub async fn try_run(
        &self,
        token: &CancellationToken,
        request: &TaskRequest,
    ) -> Result<TaskResponse> {
        if !self.limiter().try_acquire(1) {
            return Err(Error::NoFreeCapacity);
        }
        let result = self.execute(token, request).await;
        self.limiter().release(1);
        result
    }

    /// Ask the provider for its file listing and replace the local file set
    /// with the result.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let response: FileListingResponse = self
            .messenger()
            .request_sync(self.lifetime_token(), &FileListingRequest::default())
            .await?;
        self.set_files(response.files.clone());
        Ok(response.files)
    }

    /// Check whether the provider has a file, by content address.
    pub async fn probe_file(&self, r#ref: &str) -> Result<bool> {
        let response: FileProbeResponse = self
            .messenger()
            .request_sync(
                self.lifetime_token(),
                &FileProbeRequest {
                    file: Some(r#ref.to_string()),
                },
            )
            .await?;
        Ok(response.ok.unwrap_or(false))
    }

    /// Upload a file from storage to this provider: probe first, send the
    /// bytes only when absent, and remember the ref on success.
    pub async fn upload(&self, file: &StoredFile) -> Result<()> {
        let r#ref = file.file_ref().to_string();

        if self.probe_file(&r#ref).await? {
            self.add_file(r#ref);
            return Ok(()); // provider has this file already
        }

        let response: FileUploadResponse = self
            .messenger()
            .request_sync(
                self.lifetime_token(),
                &FileUploadRequest {
                    upload: Some(File {
                        r#ref: Some(r#ref.clone()),
                        media: Some(file.media.clone()),
                        blob: Some(file.bytes.clone()),
                    }),
                },
            )
            .await?;

        if let Some(err) = response.err.filter(|e| !e.is_empty()) {
            return Err(Error::Remote(format!(
                "upload {:?} failed at provider: {}",
                r#ref, err
            )));
        }
        self.add_file(r#ref);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::{IncomingStreams, Messenger};
    use crate::provider::Provider;
    use crate::transport::MemoryTransport;
    use bytes::Bytes;
    use std::sync::Arc;
    use wharf_core::StoredFile;
    use wharf_protocol::{pack_any, Payload, TaskOutput, TaskResult};

    /// Peer that answers file RPCs from a fixed set and echoes task
    /// requests after a short delay.
    fn scripted_peer(mut streams: IncomingStreams, known: Vec<String>) {
        tokio::spawn(async move {
            while let Some(request) = streams.requests.recv().await {
                match request.payload.type_url.as_str() {
                    FileListingRequest::TYPE_URL => {
                        let response = FileListingResponse {
                            files: known.clone(),
                        };
                        let _ = request.respond(Some(pack_any(&response)), None).await;
                    }
                    FileProbeRequest::TYPE_URL => {
                        let probe: FileProbeRequest = request.unpack().unwrap();
                        let response = FileProbeResponse {
                            ok: Some(known.contains(&probe.file.unwrap_or_default())),
                        };
                        let _ = request.respond(Some(pack_any(&response)), None).await;
                    }
                    FileUploadRequest::TYPE_URL => {
                        let _ = request
                            .respond(Some(pack_any(&FileUploadResponse::default())), None)
                            .await;
                    }
                    TaskRequest::TYPE_URL => {
                        tokio::spawn(async move {
                            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                            let response = TaskResponse {
                                info: None,
                                result: Some(TaskResult::Ok(TaskOutput::default())),
                            };
                            let _ = request.respond(Some(pack_any(&response)), None).await;
                        });
                    }
                    _ => {
                        let _ = request.respond(None, Some("unexpected".to_string())).await;
                    }
                }
            }
        });
    }

    fn rpc_provider(known: Vec<String>) -> Arc<Provider> {
        let (near, far) = MemoryTransport::pair("broker", "provider");
        let (messenger, _streams) = Messenger::new(Arc::new(near));
        let (_peer, peer_streams) = Messenger::new(Arc::new(far));
        scripted_peer(peer_streams, known);
        Provider::new(messenger)
    }

    #[tokio::test]
    async fn test_list_files_replaces_set() {
        let provider = rpc_provider(vec!["sha256:a".into(), "sha256:b".into()]);
        provider.set_files(vec!["sha256:stale".into()]);

        let files = provider.list_files().await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(provider.has_file("sha256:a"));
        assert!(!provider.has_file("sha256:stale"));
    }

    #[tokio::test]
    async fn test_probe_file() {
        let provider = rpc_provider(vec!["sha256:a".into()]);
        assert!(provider.probe_file("sha256:a").await.unwrap());
        assert!(!provider.probe_file("sha256:missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_sends_bytes_when_absent() {
        let provider = rpc_provider(vec![]);
        let file = StoredFile::new("application/wasm", Bytes::from_static(b"\0asm"));

        provider.upload(&file).await.unwrap();
        assert!(provider.has_file(file.file_ref()));
    }

    #[tokio::test]
    async fn test_upload_probe_hit_skips_transfer() {
        let file = StoredFile::new("application/wasm", Bytes::from_static(b"\0asm"));
        let provider = rpc_provider(vec![file.file_ref().to_string()]);

        provider.upload(&file).await.unwrap();
        assert!(provider.has_file(file.file_ref()));
    }

    #[tokio::test]
    async fn test_run_respects_limiter() {
        let provider = rpc_provider(vec![]);
        // one slot for the session loop's parked permit, one for direct runs
        provider.limiter().set_limit(2);

        let token = tokio_util::sync::CancellationToken::new();
        let response = provider.run(&token, &TaskRequest::default()).await.unwrap();
        assert!(response.is_ok());
        assert!(provider.current_tasks() <= 1, "run released its permit");
    }

    #[tokio::test]
    async fn test_try_run_fails_without_capacity() {
        let provider = rpc_provider(vec![]);
        // limit 0: no capacity at all
        let token = tokio_util::sync::CancellationToken::new();
        let err = provider
            .try_run(&token, &TaskRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoFreeCapacity));
    }
}

