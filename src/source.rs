use std::path::{Path, PathBuf};

/// A unit of source text together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    origin: String,
    content: String,
}

#[derive(Debug, thiserror::Error)]
#[error("Could not read source file '{}'", path.display())]
pub struct LoadError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
}

impl SourceFile {
    pub fn new(origin: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            content: content.into(),
        }
    }

    /// Resolves `path` to an absolute path and reads the whole file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let absolute = std::fs::canonicalize(path).map_err(|source| LoadError {
            path: path.to_path_buf(),
            source,
        })?;
        let content = std::fs::read_to_string(&absolute).map_err(|source| LoadError {
            path: absolute.clone(),
            source,
        })?;
        log::debug!("Loaded {} ({} bytes)", absolute.display(), content.len());

        Ok(Self::new(absolute.display().to_string(), content))
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file() {
        let err = SourceFile::load("definitely/not/a/real/file.cmt").unwrap_err();
        assert!(err.to_string().contains("definitely/not/a/real/file.cmt"));
    }

    #[test]
    fn test_load_resolves_absolute_path() {
        let path = std::env::temp_dir().join("comet_source_test.cmt");
        std::fs::write(&path, "var a = 1\n").unwrap();

        let source = SourceFile::load(&path).unwrap();
        assert!(Path::new(source.origin()).is_absolute());
        assert_eq!(source.content(), "var a = 1\n");

        std::fs::remove_file(&path).unwrap();
    }
}
