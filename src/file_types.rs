// File classification by extension
// Drives the listing filter tabs and the preview strategy

use serde::{Deserialize, Serialize};

/// Category of a file, derived from its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Video,
    Audio,
    Pdf,
    Document,
    Spreadsheet,
    Archive,
    Code,
    Other,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "bmp", "ico"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "avi", "mkv", "flv"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "aac", "flac", "m4a"];
const DOCUMENT_EXTENSIONS: &[&str] = &["doc", "docx"];
const SPREADSHEET_EXTENSIONS: &[&str] = &["xls", "xlsx", "csv"];
const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz"];
const CODE_EXTENSIONS: &[&str] = &[
    "json", "js", "ts", "tsx", "jsx", "css", "html", "md", "txt", "yml", "yaml", "xml", "sh",
    "py", "java", "go", "rs",
];

impl FileKind {
    /// Classify a key or file name. Case-insensitive; no extension means `Other`.
    pub fn of(name: &str) -> Self {
        let file_name = name.rsplit('/').next().unwrap_or(name);
        let extension = match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
            _ => return FileKind::Other,
        };
        let ext = extension.as_str();

        if IMAGE_EXTENSIONS.contains(&ext) {
            FileKind::Image
        } else if VIDEO_EXTENSIONS.contains(&ext) {
            FileKind::Video
        } else if AUDIO_EXTENSIONS.contains(&ext) {
            FileKind::Audio
        } else if ext == "pdf" {
            FileKind::Pdf
        } else if DOCUMENT_EXTENSIONS.contains(&ext) {
            FileKind::Document
        } else if SPREADSHEET_EXTENSIONS.contains(&ext) {
            FileKind::Spreadsheet
        } else if ARCHIVE_EXTENSIONS.contains(&ext) {
            FileKind::Archive
        } else if CODE_EXTENSIONS.contains(&ext) {
            FileKind::Code
        } else {
            FileKind::Other
        }
    }

    /// Whether the body can be shown inline as text
    pub fn is_text(self) -> bool {
        self == FileKind::Code
    }
}

/// Listing filter tabs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    #[default]
    All,
    Image,
    Video,
    Doc,
    Code,
}

impl FilterType {
    /// Whether a file of this kind passes the filter
    pub fn matches(self, kind: FileKind) -> bool {
        match self {
            FilterType::All => true,
            FilterType::Image => kind == FileKind::Image,
            FilterType::Video => kind == FileKind::Video,
            FilterType::Doc => matches!(
                kind,
                FileKind::Pdf | FileKind::Document | FileKind::Spreadsheet
            ),
            FilterType::Code => kind == FileKind::Code,
        }
    }
}

impl std::str::FromStr for FilterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(FilterType::All),
            "image" | "images" => Ok(FilterType::Image),
            "video" | "videos" => Ok(FilterType::Video),
            "doc" | "docs" => Ok(FilterType::Doc),
            "code" => Ok(FilterType::Code),
            other => Err(format!("unknown filter '{}' (all, image, video, doc, code)", other)),
        }
    }
}
