use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Reduce `name` to a single safe path component.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "draft.txt".to_string()
    } else {
        cleaned
    }
}

/// Write `content` to `dir/<sanitized filename>`, creating `dir` if needed.
pub async fn save_draft(dir: &Path, filename: &str, content: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create drafts dir {}", dir.display()))?;
    let path = dir.join(sanitize_filename(filename));
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("failed to write draft {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_path_components() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("literature_2025-01-02.html"), "literature_2025-01-02.html");
        assert_eq!(sanitize_filename("..."), "draft.txt");
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
    }

    #[tokio::test]
    async fn writes_into_created_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("drafts");
        let path = save_draft(&dir, "reply_Hello_2025-01-02.txt", "To: a@b\n\nhi")
            .await
            .unwrap();
        assert_eq!(path, dir.join("reply_Hello_2025-01-02.txt"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "To: a@b\n\nhi");
    }
}
