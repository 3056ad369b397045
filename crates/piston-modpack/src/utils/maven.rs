use crate::error::{InstallError, InstallResult};
use std::fmt;
use std::path::{Path, PathBuf};

/// A parsed Maven coordinate.
///
/// Supported formats:
///   `group:artifact:version`
///   `group:artifact:version:classifier`
///   `group:artifact:version[:classifier]@extension`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MavenCoordinate {
    pub group: String,
    pub artifact: String,
    pub version: String,
    pub classifier: Option<String>,
    /// Defaults to `"jar"`
    pub extension: String,
}

impl MavenCoordinate {
    pub fn parse(coords: &str) -> InstallResult<Self> {
        let coords = coords.trim();
        let (body, extension) = match coords.rsplit_once('@') {
            Some((body, ext)) if !ext.is_empty() => (body, ext),
            Some(_) => return Err(InstallError::InvalidMavenCoordinate(coords.to_string())),
            None => (coords, "jar"),
        };

        let parts: Vec<&str> = body.split(':').collect();
        if parts.len() < 3 || parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(InstallError::InvalidMavenCoordinate(coords.to_string()));
        }

        Ok(Self {
            group: parts[0].to_string(),
            artifact: parts[1].to_string(),
            version: parts[2].to_string(),
            classifier: parts.get(3).map(|c| c.to_string()),
            extension: extension.to_string(),
        })
    }

    pub fn file_name(&self) -> String {
        match &self.classifier {
            Some(clf) => format!(
                "{}-{}-{}.{}",
                self.artifact, self.version, clf, self.extension
            ),
            None => format!("{}-{}.{}", self.artifact, self.version, self.extension),
        }
    }

    /// `group/with/dots/as/slashes/artifact/version/file`, always `/`-separated.
    pub fn relative_path(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.group.replace('.', "/"),
            self.artifact,
            self.version,
            self.file_name()
        )
    }

    pub fn local_path(&self, libraries_dir: &Path) -> PathBuf {
        let mut path = libraries_dir.to_path_buf();
        for segment in self.relative_path().split('/') {
            path.push(segment);
        }
        path
    }
}

impl fmt::Display for MavenCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.artifact, self.version)?;
        if let Some(clf) = &self.classifier {
            write!(f, ":{}", clf)?;
        }
        if self.extension != "jar" {
            write!(f, "@{}", self.extension)?;
        }
        Ok(())
    }
}

/// Convert Maven coordinates to a filesystem path under `libraries_dir`
pub fn maven_to_path(coords: &str, libraries_dir: &Path) -> InstallResult<PathBuf> {
    Ok(MavenCoordinate::parse(coords)?.local_path(libraries_dir))
}

/// `[group:artifact:version]` → the inner coordinate
pub fn strip_coordinate_brackets(value: &str) -> Option<&str> {
    value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_coordinate() {
        let c = MavenCoordinate::parse("com.google.guava:guava:21.0").unwrap();
        assert_eq!(c.relative_path(), "com/google/guava/guava/21.0/guava-21.0.jar");
    }

    #[test]
    fn classifier_and_extension() {
        let c = MavenCoordinate::parse("net.minecraft:client:1.20.1-20230612.114412:mappings@txt")
            .unwrap();
        assert_eq!(c.classifier.as_deref(), Some("mappings"));
        assert_eq!(c.extension, "txt");
        assert_eq!(
            c.relative_path(),
            "net/minecraft/client/1.20.1-20230612.114412/client-1.20.1-20230612.114412-mappings.txt"
        );
    }

    #[test]
    fn extension_without_classifier() {
        let c = MavenCoordinate::parse("de.oceanlabs.mcp:mcp_config:1.20.1@zip").unwrap();
        assert_eq!(c.classifier, None);
        assert_eq!(c.file_name(), "mcp_config-1.20.1.zip");
        assert_eq!(c.to_string(), "de.oceanlabs.mcp:mcp_config:1.20.1@zip");
    }

    #[test]
    fn rejects_short_coordinates() {
        assert!(MavenCoordinate::parse("only:two").is_err());
        assert!(MavenCoordinate::parse("a:b:c@").is_err());
        assert!(MavenCoordinate::parse("a::c").is_err());
    }

    #[test]
    fn local_path_is_under_libraries() {
        let libs = Path::new("/data/libraries");
        let path = maven_to_path("net.minecraftforge:installertools:1.3.0:fatjar", libs).unwrap();
        assert!(path.starts_with(libs));
        assert!(path.ends_with("installertools-1.3.0-fatjar.jar"));
    }

    #[test]
    fn brackets() {
        assert_eq!(strip_coordinate_brackets("[a:b:c]"), Some("a:b:c"));
        assert_eq!(strip_coordinate_brackets("a:b:c"), None);
        assert_eq!(strip_coordinate_brackets("[]"), None);
    }
}
