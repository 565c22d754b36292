use std::fs::File;
use std::io::{Read as _, Write as _};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest as _, Sha256};

use crate::report::Reporter;

pub const DEFAULT_FIXTURES_URL: &str =
    "https://github.com/0vercl0k/kdmp-parser/releases/download/v0.1/testdatas.zip";
pub const DEFAULT_FIXTURE_NAMES: [&str; 2] = ["full.dmp", "bmp.dmp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixture {
    pub name: String,
    pub local_path: PathBuf,
}

impl Fixture {
    pub fn remove(&self) -> Result<()> {
        std::fs::remove_file(&self.local_path)
            .with_context(|| format!("remove {}", self.local_path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    pub url: String,
    pub expected_sha256: Option<String>,
    pub fixture_names: Vec<String>,
    pub download_dir: PathBuf,
}

impl ArtifactFetcher {
    pub fn new(url: impl Into<String>, download_dir: PathBuf) -> Self {
        Self {
            url: url.into(),
            expected_sha256: None,
            fixture_names: DEFAULT_FIXTURE_NAMES.iter().map(|s| s.to_string()).collect(),
            download_dir,
        }
    }

    pub fn default_download_dir() -> PathBuf {
        std::env::temp_dir().join(format!("kdmp-builder-{}", std::process::id()))
    }

    /// Downloads and unpacks the archive next to itself, then deletes it.
    /// Fixtures come back in declared order.
    pub fn fetch(&self, reporter: &Reporter) -> Result<Vec<Fixture>> {
        std::fs::create_dir_all(&self.download_dir)
            .with_context(|| format!("create_dir_all {}", self.download_dir.display()))?;

        let filename = url_filename(&self.url).unwrap_or_else(|| "testdatas.zip".to_string());
        let archive_path = self.download_dir.join(filename);

        reporter.progress(&format!("download {}", self.url));
        download(&self.url, &archive_path, self.expected_sha256.as_deref())?;

        reporter.progress(&format!(
            "downloaded {}, extracting",
            archive_path.display()
        ));
        extract_zip(&archive_path, &self.download_dir)?;
        std::fs::remove_file(&archive_path)
            .with_context(|| format!("remove {}", archive_path.display()))?;

        let mut fixtures = Vec::with_capacity(self.fixture_names.len());
        for name in &self.fixture_names {
            let local_path = self.download_dir.join(name);
            if !local_path.is_file() {
                bail!(
                    "archive {} did not contain fixture {name:?}",
                    self.url
                );
            }
            fixtures.push(Fixture {
                name: name.clone(),
                local_path,
            });
        }
        Ok(fixtures)
    }
}

fn url_filename(url: &str) -> Option<String> {
    let parsed = url.split('?').next().unwrap_or(url);
    let file = parsed.rsplit('/').next()?;
    if file.is_empty() {
        return None;
    }
    Some(file.to_string())
}

fn download(url: &str, dest: &Path, expected_sha256: Option<&str>) -> Result<()> {
    let resp = ureq::get(url)
        .call()
        .with_context(|| format!("GET {url}"))?;
    let mut reader = resp.into_body().into_reader();

    let tmp = dest.with_extension("download.tmp");
    let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 64];
    loop {
        let n = reader.read(&mut buf).context("read download stream")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        f.write_all(&buf[..n]).context("write download")?;
    }
    f.flush().ok();
    drop(f);

    if let Some(expected) = expected_sha256 {
        let actual = format!("{:x}", hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            let _ = std::fs::remove_file(&tmp);
            bail!("sha256 mismatch for {url}: expected {expected}, got {actual}");
        }
    }

    std::fs::rename(&tmp, dest)
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;
    Ok(())
}

fn extract_zip(path: &Path, out_dir: &Path) -> Result<()> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut z = zip::ZipArchive::new(f).with_context(|| format!("open zip {}", path.display()))?;
    for i in 0..z.len() {
        let mut file = z.by_index(i).context("zip entry")?;
        let name = file.name().to_string();
        let rel = sanitize_rel_path(Path::new(&name))?;
        let out_path = out_dir.join(rel);
        if file.is_dir() {
            std::fs::create_dir_all(&out_path)
                .with_context(|| format!("create_dir_all {}", out_path.display()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }
        let mut out =
            File::create(&out_path).with_context(|| format!("create {}", out_path.display()))?;
        std::io::copy(&mut file, &mut out)
            .with_context(|| format!("write {}", out_path.display()))?;
    }
    Ok(())
}

fn sanitize_rel_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(_) | Component::RootDir => {
                bail!("invalid archive path (absolute): {}", path.display())
            }
            Component::ParentDir => bail!("invalid archive path (..): {}", path.display()),
            Component::CurDir => {}
            Component::Normal(p) => out.push(p),
        }
    }
    Ok(out)
}
