//! S3 RestXml bodies: response parsing and request building
//!
//! Responses are walked element by element; leaf text is handed to a
//! per-response callback together with the element path.

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;

use super::{CommonPrefix, ObjectEntry, StorageError};

/// Walk every element of `xml`, calling `on_end(path, text)` when an element closes.
///
/// `path` includes the closing element; `text` is its unescaped direct text.
fn walk<F>(xml: &str, mut on_end: F) -> Result<(), StorageError>
where
    F: FnMut(&[String], &str),
{
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                text.clear();
            }
            Ok(Event::Empty(e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                on_end(&path, "");
                path.pop();
                text.clear();
            }
            Ok(Event::Text(e)) => {
                let decoded = e
                    .decode()
                    .map_err(|err| StorageError::ParseError(err.to_string()))?;
                let unescaped = quick_xml::escape::unescape(&decoded)
                    .map_err(|err| StorageError::ParseError(err.to_string()))?;
                text.push_str(&unescaped);
            }
            Ok(Event::CData(e)) => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::GeneralRef(e)) => {
                if let Ok(Some(ch)) = e.resolve_char_ref() {
                    text.push(ch);
                } else {
                    let name = e
                        .decode()
                        .map_err(|err| StorageError::ParseError(err.to_string()))?;
                    let resolved = quick_xml::escape::resolve_predefined_entity(&name)
                        .ok_or_else(|| {
                            StorageError::ParseError(format!("unknown entity &{};", name))
                        })?;
                    text.push_str(resolved);
                }
            }
            Ok(Event::End(_)) => {
                on_end(&path, &text);
                path.pop();
                text.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(StorageError::ParseError(e.to_string())),
        }
    }
    Ok(())
}

fn ends_with(path: &[String], tail: &[&str]) -> bool {
    path.len() >= tail.len()
        && path[path.len() - tail.len()..]
            .iter()
            .zip(tail)
            .all(|(a, b)| a == b)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// One page of a ListObjectsV2 response
#[derive(Debug, Default)]
pub struct ListPage {
    pub folders: Vec<CommonPrefix>,
    pub files: Vec<ObjectEntry>,
    pub next_token: Option<String>,
}

/// Parse a ListObjectsV2 response body
pub fn parse_list_objects(xml: &str) -> Result<ListPage, StorageError> {
    let mut page = ListPage::default();
    let mut current = ObjectEntry::new(String::new(), 0);
    let mut truncated = false;

    walk(xml, |path, text| {
        if ends_with(path, &["CommonPrefixes", "Prefix"]) {
            page.folders.push(CommonPrefix::new(text));
        } else if ends_with(path, &["Contents", "Key"]) {
            current.key = text.to_string();
        } else if ends_with(path, &["Contents", "Size"]) {
            current.size = text.trim().parse().unwrap_or(0);
        } else if ends_with(path, &["Contents", "LastModified"]) {
            current.last_modified = parse_timestamp(text.trim());
        } else if ends_with(path, &["Contents", "ETag"]) {
            current.etag = Some(text.trim().trim_matches('"').to_string());
        } else if ends_with(path, &["Contents", "StorageClass"]) {
            current.storage_class = Some(text.trim().to_string());
        } else if ends_with(path, &["Contents"]) {
            let entry = std::mem::replace(&mut current, ObjectEntry::new(String::new(), 0));
            if !entry.key.is_empty() {
                page.files.push(entry);
            }
        } else if ends_with(path, &["ListBucketResult", "NextContinuationToken"]) {
            if !text.is_empty() {
                page.next_token = Some(text.to_string());
            }
        } else if ends_with(path, &["ListBucketResult", "IsTruncated"]) {
            truncated = text.trim() == "true";
        }
    })?;

    if !truncated {
        page.next_token = None;
    }
    Ok(page)
}

/// `<Error><Code>..</Code><Message>..</Message></Error>`
#[derive(Debug, Default, PartialEq, Eq)]
pub struct S3ErrorBody {
    pub code: String,
    pub message: String,
}

/// Parse an S3 error document. Returns None when the body is not one.
pub fn parse_error(xml: &str) -> Option<S3ErrorBody> {
    let mut body = S3ErrorBody::default();
    let mut seen = false;
    walk(xml, |path, text| {
        if ends_with(path, &["Error", "Code"]) && path.len() == 2 {
            body.code = text.to_string();
            seen = true;
        } else if ends_with(path, &["Error", "Message"]) && path.len() == 2 {
            body.message = text.to_string();
        }
    })
    .ok()?;
    seen.then_some(body)
}

/// UploadId from an InitiateMultipartUploadResult
pub fn parse_upload_id(xml: &str) -> Result<String, StorageError> {
    let mut upload_id = None;
    walk(xml, |path, text| {
        if ends_with(path, &["InitiateMultipartUploadResult", "UploadId"]) {
            upload_id = Some(text.to_string());
        }
    })?;
    upload_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| StorageError::ParseError("missing UploadId".to_string()))
}

/// Keys reported in `<Error>` blocks of a DeleteResult, with their codes
pub fn parse_delete_errors(xml: &str) -> Result<Vec<String>, StorageError> {
    let mut failed = Vec::new();
    let mut key = String::new();
    let mut code = String::new();
    walk(xml, |path, text| {
        if ends_with(path, &["DeleteResult", "Error", "Key"]) {
            key = text.to_string();
        } else if ends_with(path, &["DeleteResult", "Error", "Code"]) {
            code = text.to_string();
        } else if ends_with(path, &["DeleteResult", "Error"]) {
            failed.push(format!("{} ({})", key, code));
            key.clear();
            code.clear();
        }
    })?;
    Ok(failed)
}

/// Body for CompleteMultipartUpload; `parts` must be sorted by part number
pub fn complete_multipart_body(parts: &[(u32, String)]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (number, etag) in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            number,
            quick_xml::escape::escape(etag.as_str())
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Body for DeleteObjects (quiet mode: only failures are reported)
pub fn delete_objects_body(keys: &[String]) -> String {
    let mut body = String::from("<Delete><Quiet>true</Quiet>");
    for key in keys {
        body.push_str(&format!(
            "<Object><Key>{}</Key></Object>",
            quick_xml::escape::escape(key.as_str())
        ));
    }
    body.push_str("</Delete>");
    body
}
