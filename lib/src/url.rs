//! URL model: scheme + host/port/path, directory/file split, and
//! base+relative joining, built on the `url` crate rather than hand-rolled
//! parsing (grounded in the scheme-checking idiom used against
//! `reqwest::Url` in coreos-installer's `install()`).

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    File,
    Http,
    Https,
    Tftp,
    Nfs,
    Sftp,
    Unknown,
}

impl Scheme {
    fn parse(s: &str) -> Scheme {
        match s {
            "file" => Scheme::File,
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "tftp" => Scheme::Tftp,
            "nfs" => Scheme::Nfs,
            "sftp" => Scheme::Sftp,
            _ => Scheme::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Tftp => "tftp",
            Scheme::Nfs => "nfs",
            Scheme::Sftp => "sftp",
            Scheme::Unknown => "unknown",
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Scheme::Http | Scheme::Https | Scheme::Tftp | Scheme::Nfs | Scheme::Sftp)
    }
}

/// A parsed petitboot URL. Unlike `url::Url`, file-local (scheme-less,
/// path-only) inputs are accepted, matching what the native/syslinux/grub2
/// parsers hand us for on-device paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbUrl {
    pub scheme: Scheme,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
}

impl PbUrl {
    /// `dir` is the path up to and including the final `/`; the empty
    /// string if the path has no `/`.
    pub fn dir(&self) -> &str {
        match self.path.rfind('/') {
            Some(i) => &self.path[..=i],
            None => "",
        }
    }

    /// The path component after the final `/`, or the whole path if none.
    pub fn file(&self) -> &str {
        match self.path.rfind('/') {
            Some(i) => &self.path[i + 1..],
            None => &self.path,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.scheme, Scheme::File)
    }

    /// Parse `scheme://host[:port]/path`, or a bare path (treated as
    /// `file`-local, no host).
    pub fn parse(input: &str) -> Result<PbUrl> {
        if !input.contains("://") {
            return Ok(PbUrl {
                scheme: Scheme::File,
                host: None,
                port: None,
                path: input.to_string(),
            });
        }
        let parsed = url::Url::parse(input)
            .map_err(|e| Error::Format(format!("invalid URL '{input}': {e}")))?;
        Ok(PbUrl {
            scheme: Scheme::parse(parsed.scheme()),
            host: parsed.host_str().map(str::to_string),
            port: parsed.port(),
            path: parsed.path().to_string(),
        })
    }

    /// Join a relative reference against `self` as a base:
    /// - starts with `/`: replace the path, keep scheme/host/port
    /// - contains `://`: treat as absolute, reparse entirely
    /// - otherwise: append to `self.dir()`
    pub fn join(&self, relative: &str) -> Result<PbUrl> {
        if relative.contains("://") {
            return PbUrl::parse(relative);
        }
        if let Some(rest) = relative.strip_prefix('/') {
            return Ok(PbUrl {
                path: format!("/{rest}"),
                ..self.clone()
            });
        }
        Ok(PbUrl {
            path: format!("{}{}", self.dir(), relative),
            ..self.clone()
        })
    }
}

impl fmt::Display for PbUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if matches!(self.scheme, Scheme::File) && self.host.is_none() {
            return write!(f, "{}", self.path);
        }
        write!(f, "{}://", self.scheme.as_str())?;
        if let Some(host) = &self.host {
            write!(f, "{host}")?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_path_as_local() {
        let u = PbUrl::parse("/boot/vmlinuz").unwrap();
        assert_eq!(u.scheme, Scheme::File);
        assert_eq!(u.path, "/boot/vmlinuz");
        assert!(u.host.is_none());
    }

    #[test]
    fn parses_remote_url() {
        let u = PbUrl::parse("tftp://10.0.0.1:69/pxelinux.cfg/default").unwrap();
        assert_eq!(u.scheme, Scheme::Tftp);
        assert_eq!(u.host.as_deref(), Some("10.0.0.1"));
        assert_eq!(u.port, Some(69));
        assert_eq!(u.path, "/pxelinux.cfg/default");
        assert!(u.scheme.is_remote());
    }

    #[test]
    fn dir_and_file_split() {
        let u = PbUrl::parse("http://host/a/b/vmlinuz").unwrap();
        assert_eq!(u.dir(), "/a/b/");
        assert_eq!(u.file(), "vmlinuz");
    }

    #[test]
    fn dir_of_path_without_slash_is_empty() {
        let u = PbUrl::parse("vmlinuz").unwrap();
        assert_eq!(u.dir(), "");
        assert_eq!(u.file(), "vmlinuz");
    }

    #[test]
    fn join_relative_appends_to_dir() {
        let base = PbUrl::parse("http://host/images/boot/grub.cfg").unwrap();
        let joined = base.join("initrd.img").unwrap();
        assert_eq!(joined.to_string(), "http://host/images/boot/initrd.img");
    }

    #[test]
    fn join_absolute_path_replaces_path() {
        let base = PbUrl::parse("http://host/images/boot/grub.cfg").unwrap();
        let joined = base.join("/other/kernel").unwrap();
        assert_eq!(joined.to_string(), "http://host/other/kernel");
        assert_eq!(joined.host.as_deref(), Some("host"));
    }

    #[test]
    fn join_absolute_url_replaces_everything() {
        let base = PbUrl::parse("http://host/images/boot/grub.cfg").unwrap();
        let joined = base.join("nfs://other/share/kernel").unwrap();
        assert_eq!(joined.scheme, Scheme::Nfs);
        assert_eq!(joined.host.as_deref(), Some("other"));
    }
}
