use std::path::{Path, PathBuf};

/// Directory name the agent backend uses for a project: the absolute root
/// with every `/` replaced by `-`.
pub fn project_slug(root: &Path) -> String {
    root.to_string_lossy().replace('/', "-")
}

/// `~/.claude/projects/<slug>` for the given workspace root.
pub fn default_transcripts_dir(root: &Path) -> PathBuf {
    home_dir()
        .join(".claude")
        .join("projects")
        .join(project_slug(root))
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Session ids name files directly, so anything that could escape the
/// transcripts directory is refused.
pub(crate) fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0'])
}
