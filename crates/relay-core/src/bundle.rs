//! Bundle container: a gzip-compressed tar with one root directory.
//!
//! ```text
//! <name>-<created_at>.tar.gz
//! └── <name>/
//!     ├── manifest.json
//!     ├── <name>.git/             bare mirror
//!     ├── submodules/<x>.git/     optional
//!     └── artifacts/<job>/<file>  optional
//! <name>-<created_at>.tar.gz.sha256
//! ```
//!
//! All tar/gzip work runs on the blocking pool.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Result, TransferError};
use crate::manifest::{self, Manifest, SubmoduleRef, MANIFEST_FILE};

/// Suffix of bundle files.
pub const BUNDLE_SUFFIX: &str = ".tar.gz";

/// An extracted, decoded bundle.
#[derive(Debug, Clone)]
pub struct OpenedBundle {
    /// File name of the tarball
    pub bundle_name: String,
    /// The single root directory inside the extraction directory
    pub root: PathBuf,
    pub manifest: Manifest,
}

impl OpenedBundle {
    /// Bare mirror of the main repository.
    ///
    /// Prefers `<root>/<name>.git`; falls back to the only `*.git` directory
    /// at the root when the name was derived differently at pack time.
    pub fn repository_mirror(&self, name: &str) -> Result<PathBuf> {
        let expected = self.root.join(format!("{name}.git"));
        if expected.is_dir() {
            return Ok(expected);
        }
        let mut candidates = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() && path.extension().map(|e| e == "git").unwrap_or(false) {
                candidates.push(path);
            }
        }
        match candidates.len() {
            1 => Ok(candidates.remove(0)),
            n => Err(TransferError::CorruptBundle {
                path: self.root.clone(),
                detail: format!("expected mirror {name}.git, found {n} candidate mirror(s)"),
            }),
        }
    }

    /// Mirror directory of a submodule.
    pub fn submodule_mirror(&self, sub: &SubmoduleRef) -> PathBuf {
        let direct = self.root.join(&sub.mirror);
        if direct.is_dir() {
            return direct;
        }
        // Older bundles recorded an absolute staging path; only its file name
        // under submodules/ is meaningful.
        let base = Path::new(&sub.mirror)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default();
        self.root.join("submodules").join(base)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn has_artifacts(&self) -> bool {
        self.artifacts_dir().is_dir()
    }
}

/// Path of the checksum sidecar for `bundle`.
pub fn sidecar_path(bundle: &Path) -> PathBuf {
    let mut name = bundle.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn bundle_file_name(bundle: &Path) -> String {
    bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn corrupt(path: &Path, detail: impl Into<String>) -> TransferError {
    TransferError::CorruptBundle {
        path: path.to_path_buf(),
        detail: detail.into(),
    }
}

fn verify_sidecar(bundle: &Path) -> Result<()> {
    let sidecar = sidecar_path(bundle);
    if !sidecar.exists() {
        return Ok(());
    }
    let recorded = fs::read_to_string(&sidecar)?;
    let expected = recorded
        .split_whitespace()
        .next()
        .ok_or_else(|| corrupt(bundle, "empty checksum sidecar"))?
        .to_ascii_lowercase();
    let actual = sha256_file(bundle)?;
    if expected != actual {
        return Err(corrupt(
            bundle,
            format!("checksum mismatch: expected {expected}, got {actual}"),
        ));
    }
    debug!(bundle = %bundle.display(), "checksum verified");
    Ok(())
}

fn open_bundle_blocking(bundle: &Path, workdir: &Path) -> Result<OpenedBundle> {
    verify_sidecar(bundle)?;

    let file = File::open(bundle)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive
        .unpack(workdir)
        .map_err(|e| corrupt(bundle, format!("extraction failed: {e}")))?;

    let mut roots = Vec::new();
    for entry in fs::read_dir(workdir)? {
        roots.push(entry?.path());
    }
    if roots.len() != 1 || !roots[0].is_dir() {
        return Err(corrupt(
            bundle,
            format!("expected a single root directory, found {} entries", roots.len()),
        ));
    }
    let root = roots.remove(0);

    let manifest_path = root.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(TransferError::MissingManifest(root));
    }
    let manifest = manifest::decode(&fs::read(&manifest_path)?)?;

    Ok(OpenedBundle {
        bundle_name: bundle_file_name(bundle),
        root,
        manifest,
    })
}

/// Verify, extract and decode `bundle` into the empty directory `workdir`.
pub async fn open_bundle(bundle: &Path, workdir: &Path) -> Result<OpenedBundle> {
    let bundle = bundle.to_path_buf();
    let workdir = workdir.to_path_buf();
    tokio::task::spawn_blocking(move || open_bundle_blocking(&bundle, &workdir)).await?
}

fn peek_manifest_blocking(bundle: &Path) -> Result<Manifest> {
    let file = File::open(bundle)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let entries = archive
        .entries()
        .map_err(|e| corrupt(bundle, e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(bundle, e.to_string()))?;
        let is_manifest = {
            let path = entry.path().map_err(|e| corrupt(bundle, e.to_string()))?;
            let parts: Vec<_> = path.components().collect();
            parts.len() == 2 && parts[1].as_os_str() == MANIFEST_FILE
        };
        if is_manifest {
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| corrupt(bundle, e.to_string()))?;
            return manifest::decode(&bytes);
        }
    }
    Err(TransferError::MissingManifest(bundle.to_path_buf()))
}

/// Read the manifest without extracting the bundle.
pub async fn peek_manifest(bundle: &Path) -> Result<Manifest> {
    let bundle = bundle.to_path_buf();
    tokio::task::spawn_blocking(move || peek_manifest_blocking(&bundle)).await?
}

/// Bundles in `dir`, sorted by file name.
pub fn scan_bundles(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut bundles = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && bundle_file_name(&path).ends_with(BUNDLE_SUFFIX) {
            bundles.push(path);
        }
    }
    bundles.sort_by_key(|p| bundle_file_name(p));
    Ok(bundles)
}

fn write_bundle_blocking(root: &Path, output_dir: &Path, file_name: &str) -> Result<PathBuf> {
    let root_name = root
        .file_name()
        .ok_or_else(|| corrupt(root, "staging root has no name"))?
        .to_owned();
    fs::create_dir_all(output_dir)?;

    let tmp = tempfile::NamedTempFile::new_in(output_dir)?;
    {
        let encoder = GzEncoder::new(tmp.as_file(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.append_dir_all(&root_name, root)?;
        builder.into_inner()?.finish()?;
    }
    tmp.as_file().sync_all()?;

    let target = output_dir.join(file_name);
    tmp.persist(&target).map_err(|e| e.error)?;

    let digest = sha256_file(&target)?;
    let mut sidecar = File::create(sidecar_path(&target))?;
    writeln!(sidecar, "{digest}  {file_name}")?;
    info!(bundle = %target.display(), sha256 = %digest, "bundle written");
    Ok(target)
}

/// Archive the directory `root` as `<output_dir>/<file_name>` with a
/// `.sha256` sidecar. The archive's single top-level entry is `root`'s name.
pub async fn write_bundle(root: &Path, output_dir: &Path, file_name: &str) -> Result<PathBuf> {
    let root = root.to_path_buf();
    let output_dir = output_dir.to_path_buf();
    let file_name = file_name.to_string();
    tokio::task::spawn_blocking(move || write_bundle_blocking(&root, &output_dir, &file_name))
        .await?
}
