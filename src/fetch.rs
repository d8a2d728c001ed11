//! Fetching: spec grammar parsing plus the registry and git fetchers.
//!
//! A fetch spec names a package or repository:
//!
//! ```text
//! zod            zod@3.23.8          npm:react@18.2.0
//! pypi:requests  pip:flask==3.0.0    crates:serde@1.0.200
//! github:colinhacks/zod@main         gitlab:owner/repo
//! colinhacks/zod                     (GitHub by default)
//! ```
//!
//! Registry packages are downloaded as tarballs from the npm, PyPI, and
//! crates.io APIs and extracted under `packages/<registry>/<name>/`;
//! repositories are shallow-cloned with the system `git` under
//! `repos/<host>/<owner>/<repo>/`. A source directory is fully populated
//! before the caller registers it; on failure the partial directory is
//! removed.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use tar::Archive;

use crate::models::{ParsedSpec, Source, SourceKind};

/// Parse one fetch spec into its kind, name, and optional version/ref.
pub fn parse_spec(spec: &str) -> Result<ParsedSpec> {
    let spec = spec.trim();
    if spec.is_empty() {
        bail!("Empty fetch spec");
    }

    if let Some(rest) = spec.strip_prefix("npm:") {
        let (name, version) = split_at_version(rest);
        return Ok(ParsedSpec {
            kind: SourceKind::Npm,
            name,
            version,
        });
    }
    if let Some(rest) = spec
        .strip_prefix("pypi:")
        .or_else(|| spec.strip_prefix("pip:"))
    {
        let (name, version) = match rest.split_once("==") {
            Some((n, v)) => (n.to_string(), Some(v.to_string())),
            None => (rest.to_string(), None),
        };
        return Ok(ParsedSpec {
            kind: SourceKind::Pypi,
            name,
            version,
        });
    }
    if let Some(rest) = spec
        .strip_prefix("crates:")
        .or_else(|| spec.strip_prefix("cargo:"))
    {
        let (name, version) = split_at_version(rest);
        return Ok(ParsedSpec {
            kind: SourceKind::Crates,
            name,
            version,
        });
    }
    if let Some(rest) = spec.strip_prefix("github:") {
        return parse_repo(rest, "github.com");
    }
    if let Some(rest) = spec.strip_prefix("gitlab:") {
        return parse_repo(rest, "gitlab.com");
    }

    // Unprefixed `owner/repo` is a GitHub repository; scoped npm names
    // (`@scope/name`) also contain a slash and take priority.
    if spec.contains('/') && !spec.starts_with('@') {
        return parse_repo(spec, "github.com");
    }

    let (name, version) = split_at_version(spec);
    Ok(ParsedSpec {
        kind: SourceKind::Npm,
        name,
        version,
    })
}

/// Split `name@version`, tolerating the leading `@` of scoped npm names.
fn split_at_version(s: &str) -> (String, Option<String>) {
    match s.rfind('@') {
        Some(pos) if pos > 0 => (s[..pos].to_string(), Some(s[pos + 1..].to_string())),
        _ => (s.to_string(), None),
    }
}

fn parse_repo(rest: &str, host: &str) -> Result<ParsedSpec> {
    let (path, version) = split_at_version(rest);
    let mut parts = path.splitn(2, '/');
    let owner = parts.next().unwrap_or_default();
    let repo = parts.next().unwrap_or_default();
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        bail!("Invalid repository spec '{}': expected owner/repo", rest);
    }
    Ok(ParsedSpec {
        kind: SourceKind::Repo,
        name: format!("{}/{}/{}", host, owner, repo),
        version,
    })
}

pub struct Fetcher {
    data_root: PathBuf,
    http: reqwest::blocking::Client,
}

impl Fetcher {
    pub fn new(data_root: &Path) -> Result<Fetcher> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent(concat!("opensrc/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Fetcher {
            data_root: data_root.to_path_buf(),
            http,
        })
    }

    /// Fetch one parsed spec onto disk and return the populated [`Source`].
    ///
    /// The target directory is cleared first, so a re-fetch replaces the
    /// tree in place. On error the partial directory is removed before
    /// the error propagates.
    pub fn fetch(&self, spec: &ParsedSpec) -> Result<Source> {
        let rel_path = self.relative_dir(spec);
        let dest = self.data_root.join(&rel_path);

        if dest.exists() {
            std::fs::remove_dir_all(&dest)
                .with_context(|| format!("Failed to clear {}", dest.display()))?;
        }
        std::fs::create_dir_all(&dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        let result = match spec.kind {
            SourceKind::Npm => self.fetch_npm(spec, &dest),
            SourceKind::Pypi => self.fetch_pypi(spec, &dest),
            SourceKind::Crates => self.fetch_crates(spec, &dest),
            SourceKind::Repo => self.fetch_repo(spec, &dest),
        };

        match result {
            Ok(version) => Ok(Source {
                kind: spec.kind,
                name: spec.name.clone(),
                version,
                path: rel_path,
                fetched_at: Utc::now(),
            }),
            Err(e) => {
                std::fs::remove_dir_all(&dest).ok();
                Err(e)
            }
        }
    }

    fn relative_dir(&self, spec: &ParsedSpec) -> PathBuf {
        match spec.kind {
            SourceKind::Repo => Path::new("repos").join(&spec.name),
            kind => Path::new("packages").join(kind.as_str()).join(&spec.name),
        }
    }

    fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("Request failed: {}", url))?;
        if !response.status().is_success() {
            bail!("{} returned {}", url, response.status());
        }
        response
            .json()
            .with_context(|| format!("Invalid JSON from {}", url))
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("Download failed: {}", url))?;
        if !response.status().is_success() {
            bail!("{} returned {}", url, response.status());
        }
        Ok(response.bytes()?.to_vec())
    }

    /// npm: resolve the version via the registry, download the tarball,
    /// strip the `package/` prefix. Returns the resolved version.
    fn fetch_npm(&self, spec: &ParsedSpec, dest: &Path) -> Result<String> {
        let encoded = spec.name.replace('/', "%2F");
        let meta = self.get_json(&format!("https://registry.npmjs.org/{}", encoded))?;

        let version = match &spec.version {
            Some(v) => v.clone(),
            None => meta["dist-tags"]["latest"]
                .as_str()
                .context("npm metadata missing dist-tags.latest")?
                .to_string(),
        };

        let tarball = meta["versions"][&version]["dist"]["tarball"]
            .as_str()
            .with_context(|| format!("npm version {} not found for {}", version, spec.name))?
            .to_string();

        let bytes = self.get_bytes(&tarball)?;
        extract_tar_gz(&bytes, dest, 1)?;
        Ok(version)
    }

    /// PyPI: prefer the sdist, fall back to the first distribution file.
    fn fetch_pypi(&self, spec: &ParsedSpec, dest: &Path) -> Result<String> {
        let url = match &spec.version {
            Some(v) => format!("https://pypi.org/pypi/{}/{}/json", spec.name, v),
            None => format!("https://pypi.org/pypi/{}/json", spec.name),
        };
        let meta = self.get_json(&url)?;

        let version = meta["info"]["version"]
            .as_str()
            .context("pypi metadata missing info.version")?
            .to_string();

        let urls = meta["urls"]
            .as_array()
            .context("pypi metadata missing urls")?;
        let file = urls
            .iter()
            .find(|u| u["packagetype"].as_str() == Some("sdist"))
            .or_else(|| urls.first())
            .with_context(|| format!("No distribution files for {}", spec.name))?;
        let download = file["url"]
            .as_str()
            .context("pypi distribution missing url")?;

        let bytes = self.get_bytes(download)?;
        extract_tar_gz(&bytes, dest, 1)?;
        Ok(version)
    }

    /// crates.io: resolve via the API, download `.crate` (a tar.gz with a
    /// `<name>-<version>/` top directory).
    fn fetch_crates(&self, spec: &ParsedSpec, dest: &Path) -> Result<String> {
        let version = match &spec.version {
            Some(v) => v.clone(),
            None => {
                let meta =
                    self.get_json(&format!("https://crates.io/api/v1/crates/{}", spec.name))?;
                meta["crate"]["max_stable_version"]
                    .as_str()
                    .or_else(|| meta["crate"]["max_version"].as_str())
                    .context("crates.io metadata missing version")?
                    .to_string()
            }
        };

        let bytes = self.get_bytes(&format!(
            "https://crates.io/api/v1/crates/{}/{}/download",
            spec.name, version
        ))?;
        extract_tar_gz(&bytes, dest, 1)?;
        Ok(version)
    }

    /// Shallow clone via the system `git`. Returns the ref that was
    /// cloned (`HEAD` when none was requested).
    fn fetch_repo(&self, spec: &ParsedSpec, dest: &Path) -> Result<String> {
        let url = format!("https://{}.git", spec.name);

        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", "--single-branch"]);
        if let Some(ref git_ref) = spec.version {
            cmd.args(["--branch", git_ref]);
        }
        cmd.arg(&url);
        cmd.arg(dest);

        let output = cmd
            .output()
            .context("Failed to execute 'git clone'. Is git installed?")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git clone failed: {}", stderr.trim());
        }

        // The .git directory is dead weight for indexing and grep.
        std::fs::remove_dir_all(dest.join(".git")).ok();

        Ok(spec.version.clone().unwrap_or_else(|| "HEAD".to_string()))
    }
}

/// Extract a gzipped tarball into `dest`, dropping the first
/// `strip_components` path components of every entry. Entries that would
/// escape `dest` are skipped.
fn extract_tar_gz(bytes: &[u8], dest: &Path, strip_components: usize) -> Result<()> {
    let decoder = GzDecoder::new(bytes);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries().context("Corrupt tarball")? {
        let mut entry = entry.context("Corrupt tarball entry")?;
        let path = entry.path().context("Tarball entry has invalid path")?;

        let stripped: PathBuf = path.components().skip(strip_components).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if stripped
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            continue;
        }

        let target = dest.join(&stripped);
        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target).ok();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_is_npm() {
        let spec = parse_spec("zod").unwrap();
        assert_eq!(spec.kind, SourceKind::Npm);
        assert_eq!(spec.name, "zod");
        assert_eq!(spec.version, None);
    }

    #[test]
    fn npm_with_version() {
        let spec = parse_spec("npm:react@18.2.0").unwrap();
        assert_eq!(spec.kind, SourceKind::Npm);
        assert_eq!(spec.name, "react");
        assert_eq!(spec.version.as_deref(), Some("18.2.0"));
    }

    #[test]
    fn scoped_npm_name_keeps_scope() {
        let spec = parse_spec("@types/node@20.0.0").unwrap();
        assert_eq!(spec.kind, SourceKind::Npm);
        assert_eq!(spec.name, "@types/node");
        assert_eq!(spec.version.as_deref(), Some("20.0.0"));
    }

    #[test]
    fn pypi_double_equals() {
        let spec = parse_spec("pip:flask==3.0.0").unwrap();
        assert_eq!(spec.kind, SourceKind::Pypi);
        assert_eq!(spec.name, "flask");
        assert_eq!(spec.version.as_deref(), Some("3.0.0"));
    }

    #[test]
    fn cargo_alias() {
        let spec = parse_spec("cargo:serde@1.0.200").unwrap();
        assert_eq!(spec.kind, SourceKind::Crates);
        assert_eq!(spec.name, "serde");
    }

    #[test]
    fn bare_owner_repo_is_github() {
        let spec = parse_spec("colinhacks/zod").unwrap();
        assert_eq!(spec.kind, SourceKind::Repo);
        assert_eq!(spec.name, "github.com/colinhacks/zod");
        assert_eq!(spec.version, None);
    }

    #[test]
    fn github_prefix_with_ref() {
        let spec = parse_spec("github:colinhacks/zod@main").unwrap();
        assert_eq!(spec.name, "github.com/colinhacks/zod");
        assert_eq!(spec.version.as_deref(), Some("main"));
    }

    #[test]
    fn gitlab_prefix() {
        let spec = parse_spec("gitlab:inkscape/inkscape").unwrap();
        assert_eq!(spec.name, "gitlab.com/inkscape/inkscape");
    }

    #[test]
    fn invalid_repo_specs_rejected() {
        assert!(parse_spec("github:justowner").is_err());
        assert!(parse_spec("github:a/b/c").is_err());
        assert!(parse_spec("").is_err());
    }

    #[test]
    fn extract_strips_prefix_and_blocks_escape() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let data = b"export {};\n";
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header.clone(), "package/index.ts", &data[..])
            .unwrap();
        builder
            .append_data(&mut header.clone(), "package/nested/../../escape.ts", &data[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let tmp = tempfile::TempDir::new().unwrap();
        extract_tar_gz(&bytes, tmp.path(), 1).unwrap();

        assert!(tmp.path().join("index.ts").exists());
        assert!(!tmp.path().parent().unwrap().join("escape.ts").exists());
    }
}
