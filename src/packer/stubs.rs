//! Prebuilt stub binaries.
//!
//! The freestanding loaders are built by the `stub/` package, one flat
//! binary per variant, and looked up by name:
//!
//! * `loader-<arch>-<linkage>-<codec>.bin`, and `...-pw.bin` for the
//!   password-gated variant
//! * `stage0-<arch>.bin`

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::PackError;
use crate::codec::CodecId;
use crate::elf::Arch;
use crate::loader::Linkage;

/// Environment variable naming the stub directory.
pub const STUB_DIR_VAR: &str = "ELFPACK_STUB_DIR";

/// Which loader variant a packed file needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StubKey {
    pub arch: Arch,
    pub linkage: Linkage,
    pub codec: CodecId,
    pub password: bool,
}

impl StubKey {
    pub fn file_name(&self) -> String {
        format!("loader-{}-{}-{}{}.bin",
            self.arch.name(), self.linkage.name(), self.codec.name(),
            if self.password { "-pw" } else { "" })
    }
}

pub fn stage0_file_name(arch: Arch) -> String {
    format!("stage0-{}.bin", arch.name())
}

/// A provider of stub binaries.
pub trait StubSource {
    /// The loader for `key`. A missing variant is `PackError::MissingStub`.
    fn loader(&self, key: &StubKey) -> Result<Vec<u8>, PackError>;

    /// The stage-0 wrapper for `arch`, or `None` if there isn't one.
    fn stage0(&self, arch: Arch) -> Result<Option<Vec<u8>>, PackError>;
}

/// Stubs stored as files in one directory.
#[derive(Clone, Debug)]
pub struct StubDir {
    dir: PathBuf,
}

impl StubDir {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        StubDir { dir: dir.as_ref().to_owned() }
    }

    /// `ELFPACK_STUB_DIR` if set, else `stubs/` next to the running
    /// executable.
    pub fn from_env() -> io::Result<Self> {
        if let Some(dir) = std::env::var_os(STUB_DIR_VAR) {
            return Ok(StubDir::new(dir));
        }
        let exe = std::env::current_exe()?;
        let parent = exe.parent().unwrap_or_else(|| Path::new("."));
        Ok(StubDir::new(parent.join("stubs")))
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, PackError> {
        let path = self.dir.join(name);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PackError::Io { path, err }),
        }
    }
}

impl StubSource for StubDir {
    fn loader(&self, key: &StubKey) -> Result<Vec<u8>, PackError> {
        let name = key.file_name();
        debug!("stub: {}", self.dir.join(&name).display());
        self.read(&name)?.ok_or(PackError::MissingStub { name })
    }

    fn stage0(&self, arch: Arch) -> Result<Option<Vec<u8>>, PackError> {
        self.read(&stage0_file_name(arch))
    }
}
