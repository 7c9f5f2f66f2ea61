//! Content extraction for embedding and lexical matching.
//!
//! Prepares a file for embedding:
//! 1. Read the leading bytes
//! 2. Binary or empty content becomes a placeholder naming the file
//! 3. Text is lossily decoded and truncated to the configured length

use std::io::Read;
use std::path::Path;

/// Bytes sniffed to tell text from binary
const SNIFF_LEN: usize = 8 * 1024;
/// Characters of context either side of a match in a preview
const PREVIEW_CONTEXT: usize = 50;

/// What gets sent to a provider for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub text: String,
    /// Text stands in for content that could not be used
    pub placeholder: bool,
    /// Read failure behind a placeholder, if any
    pub error: Option<String>,
}

/// Read up to `max_bytes` from the start of a file.
fn read_head(path: &Path, max_bytes: usize) -> std::io::Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut buf = Vec::new();
    file.take(max_bytes as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn looks_binary(bytes: &[u8]) -> bool {
    let sniff = &bytes[..bytes.len().min(SNIFF_LEN)];
    if sniff.contains(&0) {
        return true;
    }
    matches!(
        infer::get(sniff).map(|t| t.matcher_type()),
        Some(
            infer::MatcherType::Image
                | infer::MatcherType::Video
                | infer::MatcherType::Audio
                | infer::MatcherType::Archive
                | infer::MatcherType::App
                | infer::MatcherType::Font
        )
    )
}

fn placeholder(name: &str, extension: &str, bytes: &[u8]) -> String {
    let kind = infer::get(bytes)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| {
            if extension.is_empty() {
                "unknown type".to_string()
            } else {
                format!(".{extension} file")
            }
        });
    format!("file: {name} ({kind})")
}

/// Truncate to `max_chars` on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Extract the embedding payload for a file. Never fails: unreadable, empty
/// or binary files yield a placeholder built from the name.
pub fn extract_payload(path: &Path, name: &str, extension: &str, max_chars: usize) -> Payload {
    // UTF-8 is at most 4 bytes per char
    let max_bytes = max_chars.saturating_mul(4).max(SNIFF_LEN);

    let bytes = match read_head(path, max_bytes) {
        Ok(bytes) => bytes,
        Err(e) => {
            return Payload {
                text: placeholder(name, extension, &[]),
                placeholder: true,
                error: Some(format!("{}: {e}", path.display())),
            }
        }
    };

    if bytes.is_empty() || looks_binary(&bytes) {
        return Payload {
            text: placeholder(name, extension, &bytes),
            placeholder: true,
            error: None,
        };
    }

    let text = String::from_utf8_lossy(&bytes);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Payload {
            text: placeholder(name, extension, &bytes),
            placeholder: true,
            error: None,
        };
    }

    Payload {
        text: truncate_chars(trimmed, max_chars).to_string(),
        placeholder: false,
        error: None,
    }
}

/// Leading text of a file for keyword matching; `None` for binary or unreadable files.
pub fn read_text(path: &Path, max_bytes: usize) -> Option<String> {
    let bytes = read_head(path, max_bytes).ok()?;
    if bytes.is_empty() || looks_binary(&bytes) {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// A window of text around the first case-insensitive occurrence of any term.
pub fn preview(text: &str, terms: &[String]) -> Option<String> {
    let lower = text.to_lowercase();
    // lowercasing can change byte lengths; only trust offsets when it did not
    if lower.len() != text.len() {
        return None;
    }

    let start = terms.iter().filter_map(|t| lower.find(t.as_str())).min()?;

    let mut from = start.saturating_sub(PREVIEW_CONTEXT);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (start + PREVIEW_CONTEXT).min(text.len());
    while !text.is_char_boundary(to) {
        to += 1;
    }

    let snippet: String = text[from..to]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    Some(format!(
        "{}{}{}",
        if from > 0 { "..." } else { "" },
        snippet,
        if to < text.len() { "..." } else { "" }
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_file_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.md");
        std::fs::write(&path, "  # Heading\nbody text  ").unwrap();

        let payload = extract_payload(&path, "notes.md", "md", 100);
        assert!(!payload.placeholder);
        assert_eq!(payload.text, "# Heading\nbody text");
    }

    #[test]
    fn test_truncation() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("long.txt");
        std::fs::write(&path, "é".repeat(50)).unwrap();

        let payload = extract_payload(&path, "long.txt", "txt", 10);
        assert_eq!(payload.text.chars().count(), 10);
    }

    #[test]
    fn test_empty_and_binary_get_placeholder() {
        let tmp = tempfile::tempdir().unwrap();
        let empty = tmp.path().join("empty.txt");
        std::fs::write(&empty, "").unwrap();
        let payload = extract_payload(&empty, "empty.txt", "txt", 100);
        assert!(payload.placeholder);
        assert_eq!(payload.text, "file: empty.txt (.txt file)");

        let png = tmp.path().join("pic.png");
        std::fs::write(&png, [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]).unwrap();
        let payload = extract_payload(&png, "pic.png", "png", 100);
        assert!(payload.placeholder);
        assert!(payload.text.contains("image/png"));
    }

    #[test]
    fn test_missing_file_reports_error() {
        let tmp = tempfile::tempdir().unwrap();
        let payload = extract_payload(&tmp.path().join("gone.txt"), "gone.txt", "txt", 100);
        assert!(payload.placeholder);
        assert!(payload.error.is_some());
    }

    #[test]
    fn test_preview_window() {
        let text = format!("{} needle {}", "a ".repeat(60), "b ".repeat(60));
        let snippet = preview(&text, &["needle".to_string()]).unwrap();
        assert!(snippet.starts_with("..."));
        assert!(snippet.ends_with("..."));
        assert!(snippet.contains("needle"));

        assert_eq!(preview("nothing here", &["needle".to_string()]), None);
    }
}
