use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hrsync_core::CandidateRecord;
use hrsync_storage::{FetchError, FetchedFile, HttpFetcher};
use serde::Deserialize;
use serde_json::Value;

use crate::flatten::{RawAttachment, RawCandidate, Text};

const MAX_NAME_CHARS: usize = 100;

/// Downloads attachment bodies. Signed attachment URLs carry their own
/// credentials, so implementations must not add auth of their own.
#[async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn download(&self, url: &str) -> Result<FetchedFile, FetchError>;
}

#[async_trait]
impl AttachmentSource for HttpFetcher {
    async fn download(&self, url: &str) -> Result<FetchedFile, FetchError> {
        self.fetch_file(url).await
    }
}

/// The resume attachment picked for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeAttachment {
    pub url: Option<String>,
    pub filename: String,
    pub created_at: Option<DateTime<Utc>>,
}

fn attachment_time(attachment: &RawAttachment) -> Option<DateTime<Utc>> {
    [&attachment.created_at, &attachment.updated_at]
        .into_iter()
        .find_map(|text| DateTime::parse_from_rfc3339(text.trimmed()).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn non_blank(text: &Text) -> Option<String> {
    (!text.is_blank()).then(|| text.trimmed().to_string())
}

/// Newest `resume` attachment of a raw Harvest payload. With `prefer_pdf`,
/// PDFs win over other formats whenever at least one is present.
pub fn choose_resume(raw: &Value, prefer_pdf: bool) -> Option<ResumeAttachment> {
    let parsed = RawCandidate::deserialize(raw).ok()?;
    let mut resumes: Vec<&RawAttachment> = parsed
        .attachments
        .iter()
        .filter(|a| a.kind.trimmed() == "resume")
        .collect();
    if prefer_pdf && resumes.iter().any(|a| is_pdf(a.filename.trimmed())) {
        resumes.retain(|a| is_pdf(a.filename.trimmed()));
    }

    // Undated attachments sort last; ties keep payload order.
    let best = resumes
        .into_iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            attachment_time(a)
                .cmp(&attachment_time(b))
                .then(ib.cmp(ia))
        })
        .map(|(_, a)| a)?;

    Some(ResumeAttachment {
        url: non_blank(&best.url),
        filename: best.filename.trimmed().to_string(),
        created_at: attachment_time(best),
    })
}

fn is_pdf(file_name: &str) -> bool {
    file_name.to_ascii_lowercase().ends_with(".pdf")
}

fn suffix_of(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?;
    (!ext.is_empty()).then(|| format!(".{ext}"))
}

fn disposition_file_name(header: &str) -> Option<String> {
    header.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") && !key.trim().eq_ignore_ascii_case("filename*") {
            return None;
        }
        let value = value.trim();
        let value = match value.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("utf-8''") => &value[7..],
            _ => value,
        };
        let value = value.trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn mime_extension(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    match mime.as_str() {
        "application/pdf" => Some(".pdf"),
        "application/msword" => Some(".doc"),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some(".docx"),
        "application/rtf" | "text/rtf" => Some(".rtf"),
        "text/plain" => Some(".txt"),
        "text/html" => Some(".html"),
        _ => None,
    }
}

/// Extension for a downloaded file, tried in order: the Content-Disposition
/// file name, the attachment's own file name, the Content-Type, the URL path.
/// Falls back to `.bin`.
pub fn detect_extension(file: &FetchedFile, url: &str, attachment_name: &str) -> String {
    file.content_disposition
        .as_deref()
        .and_then(disposition_file_name)
        .and_then(|name| suffix_of(&name))
        .or_else(|| suffix_of(attachment_name))
        .or_else(|| {
            file.content_type
                .as_deref()
                .and_then(mime_extension)
                .map(str::to_string)
        })
        .or_else(|| {
            let path = url.split(['?', '#']).next().unwrap_or_default();
            suffix_of(path.rsplit('/').next().unwrap_or_default())
        })
        .unwrap_or_else(|| ".bin".to_string())
}

/// Make `text` safe as a file name fragment: separators become `-`, runs of
/// other unsafe characters become `_`, whitespace collapses, and the result is
/// capped at 100 characters.
pub fn sanitize_file_name(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_unsafe_run = false;
    for ch in text.trim().chars() {
        let mapped = match ch {
            '/' | '\\' => Some('-'),
            c if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ' ') => Some(c),
            c if c.is_whitespace() => Some(' '),
            _ => None,
        };
        match mapped {
            Some(c) => {
                out.push(c);
                in_unsafe_run = false;
            }
            None if !in_unsafe_run => {
                out.push('_');
                in_unsafe_run = true;
            }
            None => {}
        }
    }
    let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
    let capped: String = collapsed.chars().take(MAX_NAME_CHARS).collect();
    if capped.is_empty() {
        "unknown".to_string()
    } else {
        capped
    }
}

/// Display name used in saved file names.
pub fn candidate_display_name(candidate: &CandidateRecord) -> String {
    let full = candidate.full_name.trim();
    if !full.is_empty() {
        return full.to_string();
    }
    let joined = format!("{} {}", candidate.first_name.trim(), candidate.last_name.trim());
    let joined = joined.trim();
    if joined.is_empty() {
        "Unknown".to_string()
    } else {
        joined.to_string()
    }
}

/// `{id}_{name}_{YYYYMMDD}{extension}`; the date is `unknown` when absent.
pub fn resume_file_name(
    candidate_id: i64,
    name: &str,
    dated: Option<DateTime<Utc>>,
    extension: &str,
) -> String {
    let date = dated
        .map(|d| d.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{candidate_id}_{}_{date}{extension}", sanitize_file_name(name))
}

/// `YYYY/MM_Month` below the resume directory.
pub fn dated_subdir(dated: DateTime<Utc>) -> PathBuf {
    PathBuf::from(dated.format("%Y").to_string()).join(dated.format("%m_%B").to_string())
}

/// `path`, or the first free `stem_N.ext` next to it.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    (1..)
        .map(|n| parent.join(format!("{stem}_{n}{extension}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn newest_pdf_resume_is_preferred() {
        let raw = json!({
            "id": 1,
            "attachments": [
                { "type": "resume", "filename": "old.pdf", "url": "https://s3/old", "created_at": "2023-01-01T00:00:00Z" },
                { "type": "resume", "filename": "new.docx", "url": "https://s3/docx", "created_at": "2024-06-01T00:00:00Z" },
                { "type": "resume", "filename": "new.PDF", "url": "https://s3/new", "created_at": "2024-01-01T00:00:00Z" },
                { "type": "cover_letter", "filename": "cl.pdf", "url": "https://s3/cl", "created_at": "2025-01-01T00:00:00Z" }
            ]
        });

        let pdf = choose_resume(&raw, true).expect("resume");
        assert_eq!(pdf.url.as_deref(), Some("https://s3/new"));
        assert_eq!(pdf.filename, "new.PDF");

        let any = choose_resume(&raw, false).expect("resume");
        assert_eq!(any.filename, "new.docx");
    }

    #[test]
    fn missing_resume_or_url_is_reported() {
        assert_eq!(choose_resume(&json!({ "id": 1, "attachments": [] }), true), None);
        assert_eq!(choose_resume(&json!({ "id": 1, "attachments": "n/a" }), true), None);

        let no_url = choose_resume(
            &json!({ "id": 1, "attachments": [{ "type": "resume", "filename": "cv.pdf", "url": null }] }),
            true,
        )
        .expect("resume");
        assert_eq!(no_url.url, None);
        assert_eq!(no_url.created_at, None);
    }

    #[test]
    fn extension_detection_order() {
        let mut file = FetchedFile {
            content_disposition: Some("attachment; filename*=UTF-8''R%C3%A9sum%C3%A9.docx".into()),
            content_type: Some("application/pdf".into()),
            ..FetchedFile::default()
        };
        assert_eq!(detect_extension(&file, "https://s3/x.txt", "cv.pdf"), ".docx");

        file.content_disposition = Some("inline".into());
        assert_eq!(detect_extension(&file, "https://s3/x.txt", "cv.rtf"), ".rtf");
        assert_eq!(detect_extension(&file, "https://s3/x.txt", "cv"), ".pdf");

        file.content_type = Some("application/octet-stream".into());
        assert_eq!(detect_extension(&file, "https://s3/a/x.txt?sig=1", "cv"), ".txt");
        assert_eq!(detect_extension(&file, "https://s3/a/blob?sig=1", "cv"), ".bin");
    }

    #[test]
    fn file_names_are_sanitized_and_dated() {
        assert_eq!(sanitize_file_name("  Anne-Marie  O'Neil / Jr. "), "Anne-Marie O_Neil - Jr.");
        assert_eq!(sanitize_file_name("李 雷"), "_ _");
        assert_eq!(sanitize_file_name("   "), "unknown");
        assert_eq!(sanitize_file_name(&"x".repeat(150)).len(), 100);

        let dated = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).single().expect("ts");
        assert_eq!(
            resume_file_name(42, "Jane Doe", Some(dated), ".pdf"),
            "42_Jane Doe_20240309.pdf"
        );
        assert_eq!(resume_file_name(42, "", None, ".bin"), "42_unknown_unknown.bin");
        assert_eq!(dated_subdir(dated), PathBuf::from("2024").join("03_March"));

        let mut candidate = CandidateRecord::blank(42);
        assert_eq!(candidate_display_name(&candidate), "Unknown");
        candidate.first_name = "Jane".into();
        assert_eq!(candidate_display_name(&candidate), "Jane");
    }

    #[test]
    fn unique_path_adds_a_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("7_a.pdf");
        assert_eq!(unique_path(&path), path);
        std::fs::write(&path, b"x").expect("write");
        std::fs::write(dir.path().join("7_a_1.pdf"), b"x").expect("write");
        assert_eq!(unique_path(&path), dir.path().join("7_a_2.pdf"));
    }
}
