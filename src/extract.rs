//! Turning files into text.
//!
//! Indexing only needs a short content signature per file; the full text is
//! extracted again, on demand, when a file's chunks are materialised.

use std::path::Path;

use crate::{
    error::{Error, Result},
    text_util::truncate_chars,
};

/// Files larger than this are indexed by name only.
pub const MAX_EXTRACT_BYTES: u64 = 16 * 1024 * 1024;

/// Extensions read as UTF-8 (lossily) text.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "org", "csv", "tsv", "log", "json",
    "yaml", "yml", "toml", "ini", "cfg", "conf", "xml", "html", "htm", "css",
    "scss", "tex", "rtf", "py", "js", "ts", "tsx", "jsx", "rs", "go", "java",
    "c", "h", "cpp", "hpp", "cc", "swift", "kt", "rb", "php", "sh", "bash",
    "zsh", "sql", "r", "lua", "pl",
];

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Hex BLAKE3 digest of a file's bytes, or `None` when it cannot be read.
pub fn content_hash(path: &Path) -> Option<String> {
    let hash = std::fs::File::open(path).and_then(|file| {
        let mut hasher = blake3::Hasher::new();
        hasher.update_reader(file)?;
        Ok(hasher.finalize())
    });
    match hash {
        Ok(hash) => Some(hash.to_hex().to_string()),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "could not hash file");
            None
        }
    }
}

/// Whether text can be extracted from files of this type at all.
pub fn supports_content(path: &Path) -> bool {
    let ext = extension_of(path);
    ext == "pdf" || TEXT_EXTENSIONS.contains(&ext.as_str())
}

/// Human-readable kind of file, used to enrich path embeddings so that
/// "spreadsheet" finds `.xlsx` files.
pub fn type_description(extension: &str) -> String {
    let desc = match extension.to_lowercase().as_str() {
        "pdf" => "PDF document",
        "txt" => "text document",
        "md" | "markdown" => "markdown document",
        "doc" | "docx" => "Word document",
        "pages" => "Pages document",
        "rtf" => "rich text document",
        "xls" | "xlsx" => "Excel spreadsheet",
        "numbers" => "Numbers spreadsheet",
        "csv" | "tsv" => "spreadsheet data",
        "ppt" | "pptx" => "PowerPoint presentation",
        "key" => "Keynote presentation",
        "jpg" | "jpeg" | "png" | "gif" | "heic" | "webp" | "bmp" | "tiff" => {
            "image"
        }
        "svg" => "vector image",
        "py" => "Python code",
        "js" | "jsx" => "JavaScript code",
        "ts" | "tsx" => "TypeScript code",
        "rs" => "Rust code",
        "go" => "Go code",
        "java" => "Java code",
        "c" | "h" | "cpp" | "hpp" | "cc" => "C/C++ code",
        "swift" => "Swift code",
        "sh" | "bash" | "zsh" => "shell script",
        "sql" => "SQL script",
        "json" => "JSON data",
        "yaml" | "yml" | "toml" | "ini" | "cfg" | "conf" => "configuration",
        "html" | "htm" => "HTML page",
        "css" | "scss" => "CSS stylesheet",
        "" => "file",
        other => return format!("{other} file"),
    };
    desc.to_string()
}

/// Text embedded as a file's name vector: its path relative to the indexed
/// root plus its type description.
pub fn path_text(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    format!(
        "{} - {}",
        relative.display(),
        type_description(&extension_of(path))
    )
}

/// Full text of a file, or `None` when its type carries no extractable text
/// or it holds nothing but whitespace.
pub fn extract_text(path: &Path) -> Result<Option<String>> {
    if !supports_content(path) {
        return Ok(None);
    }
    let size = std::fs::metadata(path)?.len();
    if size > MAX_EXTRACT_BYTES {
        tracing::debug!(path = %path.display(), size, "too large to extract");
        return Ok(None);
    }

    let text = if extension_of(path) == "pdf" {
        // pdf-extract panics on some malformed documents.
        match std::panic::catch_unwind(|| pdf_extract::extract_text(path)) {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                return Err(Error::Extraction {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(Error::Extraction {
                    path: path.to_path_buf(),
                    message: "PDF parser panicked".to_string(),
                });
            }
        }
    } else {
        String::from_utf8_lossy(&std::fs::read(path)?).into_owned()
    };

    if text.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(text))
}

/// Short whitespace-collapsed prefix of a file's text, or `None` when no
/// content can be extracted. Extraction failures are logged, not raised.
pub fn content_signature(path: &Path, max_chars: usize) -> Option<String> {
    let text = match extract_text(path) {
        Ok(Some(text)) => text,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "content extraction failed");
            return None;
        }
    };
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(truncate_chars(&flat, max_chars).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_descriptions() {
        assert_eq!(type_description("XLSX"), "Excel spreadsheet");
        assert_eq!(type_description("pdf"), "PDF document");
        assert_eq!(type_description("bin"), "bin file");
        assert_eq!(type_description(""), "file");
    }

    #[test]
    fn content_hash_follows_bytes_not_names() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.txt");
        let b = tmp.path().join("renamed.md");
        std::fs::write(&a, "same bytes").unwrap();
        std::fs::write(&b, "same bytes").unwrap();
        let hash = content_hash(&a).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(content_hash(&b), Some(hash.clone()));

        std::fs::write(&b, "other bytes").unwrap();
        assert_ne!(content_hash(&b), Some(hash));
        assert!(content_hash(&tmp.path().join("missing")).is_none());
    }

    #[test]
    fn path_text_is_relative() {
        let text = path_text(
            Path::new("/home/u"),
            Path::new("/home/u/Documents/Finance/2024-budget.xlsx"),
        );
        assert_eq!(text, "Documents/Finance/2024-budget.xlsx - Excel spreadsheet");
    }

    #[test]
    fn signature_is_collapsed_and_truncated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, "Quarterly\n\n  budget   review ".repeat(100)).unwrap();

        let sig = content_signature(&path, 30).unwrap();
        assert_eq!(sig.chars().count(), 30);
        assert!(sig.starts_with("Quarterly budget review"));
    }

    #[test]
    fn unsupported_types_have_no_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob.bin");
        std::fs::write(&path, [0u8, 1, 2, 3]).unwrap();

        assert!(!supports_content(&path));
        assert!(extract_text(&path).unwrap().is_none());
        assert!(content_signature(&path, 100).is_none());
    }

    #[test]
    fn blank_text_files_have_no_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.md");
        std::fs::write(&path, "  \n ").unwrap();
        assert!(extract_text(&path).unwrap().is_none());
    }

    #[test]
    fn broken_pdf_degrades_to_no_signature() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.pdf");
        std::fs::write(&path, b"not really a pdf").unwrap();

        assert!(extract_text(&path).is_err());
        assert!(content_signature(&path, 100).is_none());
    }
}
