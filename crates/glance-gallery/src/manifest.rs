//! CSV manifest of gallery image paths, one row per feature row.

use std::path::Path;

use crate::error::GalleryError;

/// Header names recognized as the path column, compared case-insensitively.
pub const PATH_COLUMNS: [&str; 5] = ["path", "file", "filename", "image", "img"];

/// Split CSV text into records.
///
/// Handles quoted fields with embedded commas, doubled quotes and line
/// breaks, plus `\n` or `\r\n` record endings. Blank lines are dropped.
pub fn parse_csv(text: &str) -> Result<Vec<Vec<String>>, GalleryError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(GalleryError::Manifest("unterminated quoted field".to_string()));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, record);
    }
    Ok(records)
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    let blank = record.len() == 1 && record[0].is_empty();
    if !blank {
        records.push(record);
    }
}

/// Index of the path column: the first recognized header, else column 0.
pub fn path_column(header: &[String]) -> usize {
    header
        .iter()
        .position(|h| {
            let h = h.trim().to_ascii_lowercase();
            PATH_COLUMNS.contains(&h.as_str())
        })
        .unwrap_or(0)
}

/// Make a manifest path relative to the gallery root.
///
/// Relative paths are kept. Absolute paths under `root` lose the root
/// prefix; other absolute paths are reduced to their file name. Without a
/// root, paths are kept as written.
pub fn relativize(path: &str, root: Option<&Path>) -> String {
    let Some(root) = root else {
        return path.to_string();
    };
    let normalized = path.replace('\\', "/");
    if !is_absolute(&normalized) {
        return path.to_string();
    }

    let root = root.to_string_lossy().replace('\\', "/");
    let root = root.trim_end_matches('/');
    if let Some(rest) = normalized.strip_prefix(root) {
        if let Some(rel) = rest.strip_prefix('/') {
            if !rel.is_empty() {
                return rel.to_string();
            }
        }
    }
    normalized
        .rsplit('/')
        .next()
        .unwrap_or(normalized.as_str())
        .to_string()
}

/// Unix-style or drive-letter absolute path.
fn is_absolute(path: &str) -> bool {
    let b = path.as_bytes();
    path.starts_with('/') || (b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && b[2] == b'/')
}

/// Read the manifest at `path` and return one cleaned path per non-blank row.
pub fn read_manifest(path: &Path, root: Option<&Path>) -> Result<Vec<String>, GalleryError> {
    let text = std::fs::read_to_string(path)?;
    let mut records = parse_csv(&text)?.into_iter();
    let Some(header) = records.next() else {
        return Ok(Vec::new());
    };
    let col = path_column(&header);

    Ok(records
        .filter_map(|row| {
            let cell = row.get(col)?.trim();
            (!cell.is_empty()).then(|| relativize(cell, root))
        })
        .collect())
}

/// Write a single-column manifest with a `path` header.
pub fn write_manifest(path: &Path, paths: &[String]) -> Result<(), GalleryError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = String::from("path\n");
    for p in paths {
        out.push_str(&quote_field(p));
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
