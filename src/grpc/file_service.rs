//! `FileService` — thin file-store management surface (§4.9): persists
//! raw bytes and metadata, defers chunking/embedding to the external
//! indexing collaborator.

use std::path::PathBuf;
use std::sync::Arc;
use tonic::{Request, Response, Status, Streaming};

use futures_util::stream;

use super::interceptors::authenticate;
use super::pb;
use crate::auth::{Authenticator, Permission, RateLimiter};
use crate::catalog::FileCatalog;
use crate::error::GatewayError;
use crate::files;

const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

pub struct FileServiceImpl {
    pub authenticator: Arc<Authenticator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub catalog: Arc<FileCatalog>,
    pub upload_dir: PathBuf,
}

#[tonic::async_trait]
impl pb::file_service_server::FileService for FileServiceImpl {
    async fn create_store(
        &self,
        request: Request<pb::CreateStoreRequest>,
    ) -> Result<Response<pb::CreateStoreReply>, Status> {
        let client = authenticate(request.metadata(), &self.authenticator, &self.rate_limiter).await?;
        require(&client, Permission::Files)?;
        let req = request.into_inner();
        let store_id = self.catalog.create_store(&req.tenant_id, &req.name);
        Ok(Response::new(pb::CreateStoreReply { store_id }))
    }

    async fn upload_file(
        &self,
        request: Request<Streaming<pb::UploadFileChunk>>,
    ) -> Result<Response<pb::UploadFileReply>, Status> {
        let client = authenticate(request.metadata(), &self.authenticator, &self.rate_limiter).await?;
        require(&client, Permission::Files)?;

        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("upload stream closed before the first chunk"))?;

        let tenant_id = first
            .tenant_id
            .ok_or_else(|| Status::invalid_argument("first chunk must set tenant_id"))?;
        let store_id = first
            .store_id
            .ok_or_else(|| Status::invalid_argument("first chunk must set store_id"))?;
        let filename = first.filename.unwrap_or_else(|| "upload.bin".to_string());
        let mime_type = first.mime_type.unwrap_or_else(|| "application/octet-stream".to_string());

        let mut first_data = Some(first.data);
        let byte_chunks = stream::unfold(inbound, move |mut inbound| {
            let leading = first_data.take();
            async move {
                if let Some(data) = leading {
                    return Some((Ok(data), inbound));
                }
                match inbound.message().await {
                    Ok(Some(chunk)) => Some((Ok(chunk.data), inbound)),
                    Ok(None) => None,
                    Err(status) => Some((
                        Err(GatewayError::UpstreamTransient(status.message().to_string())),
                        inbound,
                    )),
                }
            }
        });
        tokio::pin!(byte_chunks);

        let uploaded = files::receive_upload(byte_chunks, &self.upload_dir, &filename, MAX_UPLOAD_BYTES)
            .await
            .map_err(Into::<Status>::into)?;

        let file_id = self
            .catalog
            .put_file(&tenant_id, &store_id, &filename, &mime_type, uploaded.size_bytes, uploaded.path.clone())
            .map_err(|e| {
                let path = uploaded.path.clone();
                tokio::spawn(async move { let _ = files::discard(&path).await; });
                Status::from(e)
            })?;

        Ok(Response::new(pb::UploadFileReply { file_id, size_bytes: uploaded.size_bytes }))
    }

    async fn delete_file(
        &self,
        request: Request<pb::DeleteFileRequest>,
    ) -> Result<Response<pb::DeleteFileReply>, Status> {
        let client = authenticate(request.metadata(), &self.authenticator, &self.rate_limiter).await?;
        require(&client, Permission::Files)?;
        let req = request.into_inner();

        match self.catalog.remove_file(&req.tenant_id, &req.file_id) {
            Some(record) => {
                files::discard(&record.path).await.map_err(Into::<Status>::into)?;
                Ok(Response::new(pb::DeleteFileReply { deleted: true }))
            }
            None => Ok(Response::new(pb::DeleteFileReply { deleted: false })),
        }
    }

    async fn get_file(&self, request: Request<pb::GetFileRequest>) -> Result<Response<pb::FileMetadata>, Status> {
        let client = authenticate(request.metadata(), &self.authenticator, &self.rate_limiter).await?;
        require(&client, Permission::Files)?;
        let req = request.into_inner();

        let record = self
            .catalog
            .get_file(&req.tenant_id, &req.file_id)
            .map_err(Into::<Status>::into)?;

        Ok(Response::new(pb::FileMetadata {
            file_id: record.file_id,
            store_id: record.store_id,
            filename: record.filename,
            mime_type: record.mime_type,
            size_bytes: record.size_bytes,
            created_at: record.created_at.to_rfc3339(),
        }))
    }

    async fn list_files(
        &self,
        request: Request<pb::ListFilesRequest>,
    ) -> Result<Response<pb::ListFilesReply>, Status> {
        let client = authenticate(request.metadata(), &self.authenticator, &self.rate_limiter).await?;
        require(&client, Permission::Files)?;
        let req = request.into_inner();

        let files = self
            .catalog
            .list_files(&req.tenant_id, &req.store_id)
            .into_iter()
            .map(|record| pb::FileMetadata {
                file_id: record.file_id,
                store_id: record.store_id,
                filename: record.filename,
                mime_type: record.mime_type,
                size_bytes: record.size_bytes,
                created_at: record.created_at.to_rfc3339(),
            })
            .collect();

        Ok(Response::new(pb::ListFilesReply { files }))
    }
}

fn require(client: &crate::auth::ClientKey, perm: Permission) -> Result<(), Status> {
    Authenticator::require_permission(client, perm).map_err(Into::into)
}
