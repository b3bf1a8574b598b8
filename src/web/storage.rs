use std::path::Path;

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::{
    config::Settings,
    web::{ApiError, json_error},
};

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Create the upload and download roots if they do not exist yet.
pub async fn ensure_directories(settings: &Settings) -> std::io::Result<()> {
    tokio::fs::create_dir_all(settings.uploads_dir()).await?;
    tokio::fs::create_dir_all(settings.downloads_dir()).await
}

/// Stream a file from disk with an attachment disposition.
pub async fn stream_file(
    path: &Path,
    filename: &str,
    content_type: &'static str,
) -> Result<Response, ApiError> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        error!(?err, file = %path.display(), "failed to read download file");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read the download file.")
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    let disposition = HeaderValue::from_str(&attachment_disposition(filename)).map_err(|_| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Invalid download header value.",
        )
    })?;
    headers.insert(header::CONTENT_DISPOSITION, disposition);

    Ok((headers, bytes).into_response())
}

/// `attachment` disposition with the quotes and non-ASCII characters of `filename` replaced.
fn attachment_disposition(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .map(|c| if c == '"' || c == '\\' { '_' } else { c })
        .collect();
    format!("attachment; filename=\"{}\"", safe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_is_header_safe() {
        assert_eq!(
            attachment_disposition("topics.xlsx"),
            "attachment; filename=\"topics.xlsx\""
        );
        let value = attachment_disposition("选题 \"v2\".xlsx");
        assert!(HeaderValue::from_str(&value).is_ok());
        assert_eq!(value, "attachment; filename=\"__ _v2_.xlsx\"");
    }

    #[tokio::test]
    async fn streams_file_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.xlsx");
        tokio::fs::write(&path, b"xlsx-bytes").await.unwrap();

        let response = stream_file(&path, "out.xlsx", XLSX_CONTENT_TYPE)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            HeaderValue::from_static(XLSX_CONTENT_TYPE)
        );
    }

    #[tokio::test]
    async fn missing_file_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = stream_file(&dir.path().join("gone.xlsx"), "gone.xlsx", XLSX_CONTENT_TYPE)
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
