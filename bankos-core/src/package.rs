//! Volume provisioning from ZIP packages.
//!
//! A package is a ZIP file of programs and data plus an optional
//! `manifest.json`:
//! ```json
//! {
//!   "name": "Demo",
//!   "files": [
//!     { "src": "hello.exe" },
//!     { "src": "notes/readme.txt", "dst": "README.TXT", "attributes": { "readOnly": true } }
//!   ],
//!   "autorun": { "program": "hello.exe", "args": ["hello", "world"] }
//! }
//! ```
//! Files the manifest does not list are still installed, under their 8.3
//! name.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};

use serde::{Deserialize, Serialize};
use zip::ZipArchive;

use crate::error::{KernelError, KernelResult};
use crate::fs::{Attributes, BlockDevice, FileMode, Filesystem, ShortName};

/// Attribute flags for an installed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttributes {
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub system: bool,
}

impl FileAttributes {
    pub fn to_attributes(&self) -> Attributes {
        let mut bits = 0;
        if self.read_only {
            bits |= Attributes::READ_ONLY;
        }
        if self.hidden {
            bits |= Attributes::HIDDEN;
        }
        if self.system {
            bits |= Attributes::SYSTEM;
        }
        Attributes::from_bits(bits)
    }
}

/// File entry in a package manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub src: String,
    #[serde(default)]
    pub dst: Option<String>,
    #[serde(default)]
    pub attributes: Option<FileAttributes>,
}

impl FileEntry {
    /// Name the file gets on the volume.
    pub fn target(&self) -> ShortName {
        ShortName::normalize(basename(self.dst.as_deref().unwrap_or(&self.src)))
    }
}

/// Program to start once the volume is provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Autorun {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Package manifest schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub autorun: Option<Autorun>,
}

/// Loaded package: the manifest plus file contents keyed by 8.3 name.
#[derive(Debug, Clone)]
pub struct LoadedPackage {
    pub manifest: PackageManifest,
    pub files: HashMap<ShortName, Vec<u8>>,
}

impl LoadedPackage {
    /// Contents for a manifest entry.
    pub fn content(&self, entry: &FileEntry) -> Option<&[u8]> {
        self.files
            .get(&ShortName::normalize(basename(&entry.src)))
            .map(|data| data.as_slice())
    }
}

fn basename(path: &str) -> &str {
    path.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(path)
}

fn is_manifest(name: &str) -> bool {
    basename(name).eq_ignore_ascii_case("manifest.json")
}

/// Load a package from ZIP data.
pub fn load_package<R: Read + Seek>(reader: R) -> KernelResult<LoadedPackage> {
    let mut archive = ZipArchive::new(reader)?;
    let mut files: HashMap<ShortName, Vec<u8>> = HashMap::new();
    let mut manifest: Option<PackageManifest> = None;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        if is_manifest(&name) {
            let parsed = serde_json::from_slice(&content)
                .map_err(|e| KernelError::Package(format!("{}: {}", name, e)))?;
            manifest = Some(parsed);
        } else {
            files.insert(ShortName::normalize(basename(&name)), content);
        }
    }

    let mut manifest = manifest.unwrap_or_else(|| PackageManifest {
        name: "Unnamed Package".to_string(),
        version: None,
        description: None,
        files: Vec::new(),
        autorun: None,
    });

    for entry in &manifest.files {
        let source = ShortName::normalize(basename(&entry.src));
        if !files.contains_key(&source) {
            return Err(KernelError::Package(format!(
                "{}: manifest lists missing file {}",
                manifest.name, entry.src
            )));
        }
    }

    // Unlisted files are installed as-is
    let listed: HashSet<ShortName> = manifest
        .files
        .iter()
        .map(|entry| ShortName::normalize(basename(&entry.src)))
        .collect();
    let mut extra: Vec<String> = files
        .keys()
        .filter(|name| !listed.contains(name))
        .map(|name| name.to_string())
        .collect();
    extra.sort();
    manifest.files.extend(extra.into_iter().map(|src| FileEntry {
        src,
        dst: None,
        attributes: None,
    }));

    Ok(LoadedPackage { manifest, files })
}

/// Load a package from a file path.
pub fn load_package_from_path(path: &std::path::Path) -> KernelResult<LoadedPackage> {
    let file = std::fs::File::open(path)?;
    load_package(std::io::BufReader::new(file))
}

/// Write one file onto the volume, replacing any existing file of that
/// name.
pub fn install_file<D: BlockDevice>(
    fs: &mut Filesystem<D>,
    name: &ShortName,
    data: &[u8],
    attributes: Attributes,
) -> KernelResult<()> {
    let name = name.to_string();

    match fs.info(&name) {
        Ok(_) => {
            fs.set_attributes(&name, Attributes::default())?;
            fs.delete(&name)?;
        }
        Err(KernelError::FileNotFound) => {}
        Err(e) => return Err(e),
    }

    let fd = fs.open(&name, FileMode::Write)?;
    let written = fs.write(fd, data);
    fs.close(fd)?;
    if written? < data.len() {
        return Err(KernelError::DiskFull);
    }

    if attributes.bits() != 0 {
        fs.set_attributes(&name, attributes)?;
    }
    if fs.trace {
        eprintln!("[FS] Installed {} ({} bytes)", name, data.len());
    }
    Ok(())
}

/// Install every file of a package. Returns the names written, in
/// manifest order.
pub fn provision<D: BlockDevice>(
    fs: &mut Filesystem<D>,
    package: &LoadedPackage,
) -> KernelResult<Vec<ShortName>> {
    let mut installed = Vec::new();
    for entry in &package.manifest.files {
        let data = package.content(entry).ok_or_else(|| {
            KernelError::Package(format!("missing file {}", entry.src))
        })?;
        let target = entry.target();
        let attributes = entry
            .attributes
            .map(|a| a.to_attributes())
            .unwrap_or_default();
        install_file(fs, &target, data, attributes)?;
        installed.push(target);
    }
    Ok(installed)
}
