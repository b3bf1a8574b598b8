use std::path::Path;

use axum::extract::Multipart;
use thiserror::Error;
use tokio::{fs::File, io::AsyncWriteExt};

/// Result type used by the upload helpers.
pub type UploadResult<T> = Result<T, UploadError>;

/// Error returned when validating or persisting an uploaded file.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to read the upload form: {0}")]
    Form(String),
    #[error("unsupported file field `{0}`")]
    UnexpectedField(String),
    #[error("only one file may be uploaded in field `{0}`")]
    TooManyFiles(String),
    #[error("field `{field}` does not accept `.{extension}` files")]
    UnsupportedType { field: String, extension: String },
    #[error("no file was uploaded in field `{0}`")]
    Missing(String),
    #[error("failed to store the upload: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Whether the client sent something wrong, as opposed to a server-side failure.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, UploadError::Io(_))
    }
}

/// Expectations for the single file field of a form.
#[derive(Debug, Clone, Copy)]
pub struct FileFieldConfig<'a> {
    pub field_name: &'a str,
    pub allowed_extensions: &'a [&'a str],
}

/// An upload written under the destination directory, with its contents kept in memory
/// for immediate parsing.
#[derive(Debug, Clone)]
pub struct SavedFile {
    pub original_name: String,
    pub bytes: Vec<u8>,
}

/// Ensures the destination directory exists.
pub async fn ensure_directory(path: &Path) -> UploadResult<()> {
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

/// Reads a multipart form that carries exactly one file, persisting it under `dest_dir`.
///
/// Text fields are ignored. The caller owns `dest_dir` (one directory per upload).
pub async fn receive_single_file(
    mut multipart: Multipart,
    dest_dir: &Path,
    config: FileFieldConfig<'_>,
) -> UploadResult<SavedFile> {
    ensure_directory(dest_dir).await?;

    let mut saved: Option<SavedFile> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| UploadError::Form(err.to_string()))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        let Some(file_name) = field.file_name().map(|name| name.to_string()) else {
            continue;
        };

        if field_name != config.field_name {
            return Err(UploadError::UnexpectedField(field_name));
        }
        if saved.is_some() {
            return Err(UploadError::TooManyFiles(field_name));
        }

        let extension = extension_of(&file_name);
        if !config
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
        {
            return Err(UploadError::UnsupportedType {
                field: field_name,
                extension,
            });
        }

        let stored_path = dest_dir.join(stored_name(&file_name, &extension));
        let mut file = File::create(&stored_path).await?;
        let mut bytes = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| UploadError::Form(err.to_string()))?
        {
            file.write_all(&chunk).await?;
            bytes.extend_from_slice(&chunk);
        }
        file.flush().await?;

        saved = Some(SavedFile {
            original_name: file_name,
            bytes,
        });
    }

    saved.ok_or_else(|| UploadError::Missing(config.field_name.to_string()))
}

fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

fn stored_name(original: &str, extension: &str) -> String {
    let sanitized = sanitize_filename::sanitize(original);
    if !sanitized.is_empty() {
        return sanitized;
    }
    if extension.is_empty() {
        "upload".to_string()
    } else {
        format!("upload.{extension}")
    }
}
