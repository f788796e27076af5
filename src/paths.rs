//! Path containment for jail roots
//!
//! Every path a user hands us for a jail (fstab destinations, provisioning
//! scripts) is resolved here. The canonical result must stay inside the jail
//! root, otherwise a `..` or a symlink planted inside the jail could point a
//! host-side write anywhere.

use crate::error::{Error, Result};
use soft_canonicalize::soft_canonicalize;
use std::path::{Component, Path, PathBuf};

/// Resolves paths against one jail root
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Host path for a path given inside the jail
    ///
    /// Paths already under the root are taken as resolved. Anything else is
    /// read relative to the root, leading `/` included. Symlinks and `..` are
    /// resolved before the containment check, also for paths that do not
    /// exist yet.
    pub fn to_absolute(&self, path: &Path) -> Result<PathBuf> {
        let candidate = if path.starts_with(&self.root) {
            path.to_path_buf()
        } else {
            self.root.join(strip_root(path))
        };

        let root = soft_canonicalize(&self.root)?;
        let resolved = soft_canonicalize(&candidate)?;

        if !resolved.starts_with(&root) {
            tracing::warn!(
                "{} resolves to {} outside {}",
                path.display(),
                resolved.display(),
                root.display()
            );
            return Err(Error::InsecureJailPath(path.to_path_buf()));
        }

        Ok(resolved)
    }

    /// Path as seen from inside the jail, always starting with `/`
    pub fn to_relative(&self, path: &Path) -> Result<PathBuf> {
        let inner = match path.strip_prefix(&self.root) {
            Ok(inner) => inner.to_path_buf(),
            Err(_) => {
                let root = soft_canonicalize(&self.root)?;
                path.strip_prefix(&root)
                    .map_err(|_| Error::InsecureJailPath(path.to_path_buf()))?
                    .to_path_buf()
            }
        };
        Ok(Path::new("/").join(inner))
    }
}

fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    fn jail_root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap().join("jails/foo/root");
        fs::create_dir_all(&root).unwrap();
        (dir, root)
    }

    #[test]
    fn test_dotdot_escape_from_absolute_path() {
        let resolver = PathResolver::new("/jails/foo");
        let err = resolver
            .to_absolute(Path::new("/jails/foo/../bar"))
            .unwrap_err();
        assert!(matches!(err, Error::InsecureJailPath(_)));
    }

    #[test]
    fn test_relative_path_lands_under_root() {
        let resolver = PathResolver::new("/jails/foo");
        assert_eq!(
            resolver.to_absolute(Path::new("data")).unwrap(),
            PathBuf::from("/jails/foo/data")
        );
    }

    #[test]
    fn test_absolute_path_outside_root_is_reinterpreted() {
        let (_dir, root) = jail_root();
        let resolver = PathResolver::new(&root);
        assert_eq!(
            resolver.to_absolute(Path::new("/mnt/data")).unwrap(),
            root.join("mnt/data")
        );
    }

    #[test]
    fn test_sibling_with_shared_prefix_is_not_inside() {
        let resolver = PathResolver::new("/jails/foo");
        assert_eq!(
            resolver.to_absolute(Path::new("/jails/foo2/x")).unwrap(),
            PathBuf::from("/jails/foo/jails/foo2/x")
        );
    }

    #[test]
    fn test_relative_dotdot_escape() {
        let (_dir, root) = jail_root();
        let resolver = PathResolver::new(&root);
        for input in ["../../etc", "a/../../b", "/../outside", "./../x"] {
            assert!(
                matches!(
                    resolver.to_absolute(Path::new(input)),
                    Err(Error::InsecureJailPath(_))
                ),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_dotdot_staying_inside_is_allowed() {
        let (_dir, root) = jail_root();
        let resolver = PathResolver::new(&root);
        assert_eq!(
            resolver.to_absolute(Path::new("usr/../var/db")).unwrap(),
            root.join("var/db")
        );
    }

    #[test]
    fn test_symlink_escape_rejected() {
        let (dir, root) = jail_root();
        let outside = dir.path().canonicalize().unwrap().join("outside");
        fs::create_dir_all(&outside).unwrap();
        symlink(&outside, root.join("escape")).unwrap();

        let resolver = PathResolver::new(&root);
        assert!(matches!(
            resolver.to_absolute(Path::new("/escape/file")),
            Err(Error::InsecureJailPath(_))
        ));
        assert!(matches!(
            resolver.to_absolute(&root.join("escape")),
            Err(Error::InsecureJailPath(_))
        ));
    }

    #[test]
    fn test_absolute_symlink_inside_jail_rejected() {
        let (_dir, root) = jail_root();
        symlink("/", root.join("hostroot")).unwrap();

        let resolver = PathResolver::new(&root);
        assert!(matches!(
            resolver.to_absolute(Path::new("hostroot/etc")),
            Err(Error::InsecureJailPath(_))
        ));
    }

    #[test]
    fn test_symlink_within_root_allowed() {
        let (_dir, root) = jail_root();
        fs::create_dir_all(root.join("usr/local")).unwrap();
        symlink(root.join("usr/local"), root.join("opt")).unwrap();

        let resolver = PathResolver::new(&root);
        assert_eq!(
            resolver.to_absolute(Path::new("/opt/app")).unwrap(),
            root.join("usr/local/app")
        );
    }

    #[test]
    fn test_to_relative() {
        let resolver = PathResolver::new("/jails/foo/root");
        assert_eq!(
            resolver
                .to_relative(Path::new("/jails/foo/root/mnt/data"))
                .unwrap(),
            PathBuf::from("/mnt/data")
        );
        assert_eq!(
            resolver.to_relative(Path::new("/jails/foo/root")).unwrap(),
            PathBuf::from("/")
        );
        assert!(resolver.to_relative(Path::new("/jails/other")).is_err());
    }
}
