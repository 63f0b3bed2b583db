use std::fs;
use std::io::{self, Write};
use std::path::Path;

use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::media::mimetype;
use crate::server::error::AppError;
use crate::server::AppState;

/// Prefix of every temp file this service writes into the upload directory.
pub const UPLOAD_PREFIX: &str = "upload-";

const FILE_FIELD: &str = "file";

/// RFC 5987 `attr-char`: everything else is percent-encoded in `filename*`.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// One uploaded image, staged on disk for the duration of a request.
///
/// The temp file is removed when this value is dropped, whichever way the
/// request ends; [`UploadRequest::finish`] removes it eagerly and reports
/// a failed removal. Processing works on [`UploadRequest::read`], never on
/// the bytes the client sent.
pub struct UploadRequest {
    file_name: String,
    temp: NamedTempFile,
}

impl UploadRequest {
    pub fn persist(upload_dir: &Path, file_name: String, bytes: &[u8]) -> io::Result<Self> {
        let suffix = mimetype::detect_extension(bytes)
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();

        let mut temp = tempfile::Builder::new()
            .prefix(UPLOAD_PREFIX)
            .suffix(&suffix)
            .tempfile_in(upload_dir)?;
        temp.write_all(bytes)?;
        temp.flush()?;

        Ok(Self { file_name, temp })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Reads the staged upload back from disk.
    pub fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(self.temp.path())
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn finish(self) {
        let path = self.temp.path().to_path_buf();
        if let Err(e) = self.temp.close() {
            warn!("Failed to remove temp file {:?}: {}", path, e);
        }
    }
}

/// Creates the upload directory and clears files a crashed process left behind.
pub fn prepare_upload_dir(dir: &Path) -> io::Result<usize> {
    fs::create_dir_all(dir)?;

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let stale = entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with(UPLOAD_PREFIX))
            .unwrap_or(false);
        if stale && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }

    if removed > 0 {
        info!("Removed {} stale uploads from {:?}", removed, dir);
    }
    Ok(removed)
}

/// Name offered to the browser: `<prefix><stem>.png`.
///
/// Directories are dropped and quotes, backslashes and control characters
/// become `_`; any other character of the stem, non-ASCII included, is kept.
pub fn download_name(prefix: &str, file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => base,
    };
    let safe: String = stem
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    format!("{}{}.png", prefix, safe)
}

/// `Content-Disposition` for a download. Names that are not plain ASCII get
/// an ASCII `filename` fallback plus the exact name in `filename*` (RFC 6266).
pub fn content_disposition(name: &str) -> String {
    if name.is_ascii() {
        return format!("attachment; filename=\"{}\"", name);
    }

    let fallback: String = name
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(name, ATTR_CHAR)
    )
}

pub async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    handle_upload(state, multipart, "removed_bg_").await
}

pub async fn remover(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    handle_upload(state, multipart, "sin_fondo_").await
}

async fn handle_upload(
    state: AppState,
    multipart: Result<Multipart, MultipartRejection>,
    prefix: &str,
) -> Result<Response, AppError> {
    let multipart = multipart.map_err(|e| AppError::Rejected(e.status(), e.body_text()))?;
    let (file_name, bytes) = read_file_field(multipart).await?;
    info!("Received {} ({} bytes)", file_name, bytes.len());

    let attachment = download_name(prefix, &file_name);
    let output =
        tokio::task::spawn_blocking(move || process_upload(&state, file_name, bytes)).await??;

    png_attachment(output, &attachment)
}

async fn read_file_field(mut multipart: Multipart) -> Result<(String, Vec<u8>), AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        if file_name.is_empty() {
            return Err(AppError::MissingFile);
        }

        let bytes = field.bytes().await.map_err(multipart_error)?;
        return Ok((file_name, bytes.to_vec()));
    }

    Err(AppError::MissingFile)
}

/// Keeps axum's status, so an upload over the body limit stays a 413.
fn multipart_error(e: MultipartError) -> AppError {
    AppError::Rejected(e.status(), e.body_text())
}

/// Blocking part of a request: session, staging, resize, inference, cleanup.
fn process_upload(state: &AppState, file_name: String, bytes: Vec<u8>) -> Result<Vec<u8>, AppError> {
    let settings = &state.settings;
    let model = state.sessions.get_session(settings.model, settings.provider)?;

    let request = UploadRequest::persist(&settings.upload_dir, file_name, &bytes)?;
    drop(bytes);
    debug!("Staged {} at {:?}", request.file_name(), request.path());

    let staged = request.read()?;
    let output = {
        let resized = state.resizer.resize(&staged, settings.max_dimension);
        info!(
            "Processing {} ({} bytes after resize)",
            request.file_name(),
            resized.len()
        );
        model.remove_background(&resized)
    };

    let output = output.map_err(|e| {
        error!("Error processing {}: {:#}", request.file_name(), e);
        AppError::Processing(format!("{:#}", e))
    });
    request.finish();

    let output = output?;
    info!("Processing completed ({} bytes)", output.len());
    Ok(output)
}

fn png_attachment(body: Vec<u8>, file_name: &str) -> Result<Response, AppError> {
    let disposition = HeaderValue::from_str(&content_disposition(file_name))
        .map_err(|e| AppError::Processing(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/png")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// Directory listing helper shared by the handler tests.
#[cfg(test)]
pub(crate) fn staged_files(dir: &Path) -> Vec<std::path::PathBuf> {
    fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_name_strips_last_extension() {
        assert_eq!(download_name("removed_bg_", "photo.jpg"), "removed_bg_photo.png");
        assert_eq!(download_name("removed_bg_", "a.b.jpeg"), "removed_bg_a.b.png");
        assert_eq!(download_name("sin_fondo_", "noext"), "sin_fondo_noext.png");
    }

    #[test]
    fn test_download_name_drops_directories_and_unsafe_chars() {
        assert_eq!(download_name("removed_bg_", "../../etc/pa\"ss.png"), "removed_bg_pa_ss.png");
        assert_eq!(download_name("removed_bg_", "C:\\fotos\\cañón.jpg"), "removed_bg_cañón.png");
        assert_eq!(download_name("removed_bg_", "my photo.png"), "removed_bg_my photo.png");
        assert_eq!(download_name("removed_bg_", "tab\there.png"), "removed_bg_tab_here.png");
    }

    #[test]
    fn test_content_disposition_keeps_non_ascii_names() {
        assert_eq!(
            content_disposition("removed_bg_photo.png"),
            "attachment; filename=\"removed_bg_photo.png\""
        );
        assert_eq!(
            content_disposition("removed_bg_cañón.png"),
            "attachment; filename=\"removed_bg_ca__n.png\"; \
             filename*=UTF-8''removed_bg_ca%C3%B1%C3%B3n.png"
        );
        assert_eq!(
            content_disposition("sin_fondo_mi foto ü.png"),
            "attachment; filename=\"sin_fondo_mi foto _.png\"; \
             filename*=UTF-8''sin_fondo_mi%20foto%20%C3%BC.png"
        );
    }

    #[test]
    fn test_persist_then_finish_removes_file() {
        let dir = tempfile::tempdir().unwrap();

        let request =
            UploadRequest::persist(dir.path(), "photo.jpg".into(), b"raw bytes").unwrap();
        let path = request.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(request.read().unwrap(), b"raw bytes");
        assert_eq!(request.file_name(), "photo.jpg");

        request.finish();
        assert!(!path.exists());
        assert!(staged_files(dir.path()).is_empty());
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();

        let path = {
            let request =
                UploadRequest::persist(dir.path(), "x.png".into(), b"data").unwrap();
            request.path().to_path_buf()
        };

        assert!(!path.exists());
    }

    #[test]
    fn test_persist_uses_sniffed_extension() {
        let dir = tempfile::tempdir().unwrap();
        let png_magic = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec();

        let request = UploadRequest::persist(dir.path(), "upload".into(), &png_magic).unwrap();
        let name = request.path().file_name().unwrap().to_string_lossy().to_string();

        assert!(name.starts_with(UPLOAD_PREFIX));
        assert!(name.ends_with(".png"));
    }

    #[test]
    fn test_persist_fails_without_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");

        assert!(UploadRequest::persist(&missing, "a.png".into(), &[1]).is_err());
    }

    #[test]
    fn test_read_reflects_the_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let request = UploadRequest::persist(dir.path(), "a.png".into(), b"first").unwrap();

        fs::write(request.path(), b"rewritten").unwrap();
        assert_eq!(request.read().unwrap(), b"rewritten");

        fs::remove_file(request.path()).unwrap();
        assert!(request.read().is_err());
    }

    #[test]
    fn test_prepare_upload_dir_clears_only_stale_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("temp_uploads");
        fs::create_dir(&uploads).unwrap();
        fs::write(uploads.join("upload-abc.jpg"), b"old").unwrap();
        fs::write(uploads.join("keep.txt"), b"mine").unwrap();

        let removed = prepare_upload_dir(&uploads).unwrap();

        assert_eq!(removed, 1);
        assert_eq!(staged_files(&uploads), vec![uploads.join("keep.txt")]);
    }

    #[test]
    fn test_prepare_upload_dir_creates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("nested").join("uploads");

        assert_eq!(prepare_upload_dir(&uploads).unwrap(), 0);
        assert!(uploads.is_dir());
    }
}
