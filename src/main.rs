//! elfpack compresses 64-bit Linux ELF executables into smaller ones that
//! decompress themselves in memory when run.
//!
//! # Packing
//!
//! ```sh
//! elfpack program            # in place, keeping program.bak
//! elfpack -o small program
//! elfpack --best -o small program
//! ```
//!
//! # Unpacking
//!
//! ```sh
//! elfpack -d small           # writes small.unpacked
//! ```
//!
//! # Exit status
//!
//! Exit status is 0 if there was no error, 2 if packing would not have made
//! the file smaller (nothing is written), or 1 for any other error.

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::Ordering;

use elfpack::codec::CodecId;
use elfpack::packer::{self, PackError, PackOptions, StubDir};
use elfpack::unpack::{self, UnpackError};

const PASSWORD_VAR: &str = "ELFPACK_PASSWORD";

/// An error that may occur while packing or unpacking a file.
#[derive(Debug)]
enum Error {
    /// An I/O error.
    Io(io::Error),
    /// A packing error.
    Pack(PackError),
    /// A depacking error.
    Unpack(UnpackError),
}

impl Error {
    fn is_soft(&self) -> bool {
        matches!(self, Error::Pack(err) if err.is_soft())
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => err.fmt(f),
            Error::Pack(err) => err.fmt(f),
            Error::Unpack(err) => err.fmt(f),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<PackError> for Error {
    fn from(err: PackError) -> Self {
        Error::Pack(err)
    }
}

impl From<UnpackError> for Error {
    fn from(err: UnpackError) -> Self {
        Error::Unpack(err)
    }
}

/// An `Error` annotated with a `Path`.
#[derive(Debug)]
struct PathError {
    path: Option<PathBuf>,
    err: Error,
}

impl PathError {
    fn new<P: AsRef<Path>>(path: P, err: Error) -> Self {
        let path = path.as_ref().to_owned();
        Self { path: Some(path), err }
    }
}

impl std::error::Error for PathError {}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PathError { path: None, err } => err.fmt(f),
            PathError { path: Some(path), err } => write!(f, "{}: {}", path.display(), err),
        }
    }
}

impl From<Error> for PathError {
    fn from(err: Error) -> Self {
        PathError { path: None, err }
    }
}

/// What the command line asked for.
#[derive(Debug)]
struct Args {
    input: PathBuf,
    output: Option<PathBuf>,
    unpack: bool,
    best: bool,
    backup: bool,
    stub_dir: Option<PathBuf>,
    verbose: bool,
    options: PackOptions,
}

enum Command {
    Help,
    Version,
    Run(Args),
}

fn parse_args() -> Result<Command, lexopt::Error> {
    use lexopt::prelude::*;

    let mut input = None;
    let mut output = None;
    let mut unpack = false;
    let mut best = false;
    let mut backup = true;
    let mut stub_dir = None;
    let mut verbose = false;
    let mut password: Option<OsString> = None;
    let mut options = PackOptions::default();

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Short('c') | Long("codec") => {
                let name = parser.value()?.string()?;
                options.codec = CodecId::from_name(&name).ok_or_else(|| lexopt::Error::UnexpectedValue {
                    option: "codec".into(),
                    value: name.into(),
                })?;
            }
            Long("best") => best = true,
            Long("filter") => options.filter = parser.value()?.parse()?,
            Long("password") => password = Some(parser.value()?),
            Long("no-strip") => options.strip = false,
            Long("stage0") => options.stage0 = parser.value()?.parse()?,
            Long("manual-reloc") => options.manual_reloc = true,
            Short('o') | Long("output") => output = Some(PathBuf::from(parser.value()?)),
            Long("no-backup") => backup = false,
            Short('d') | Long("unpack") => unpack = true,
            Long("stub-dir") => stub_dir = Some(PathBuf::from(parser.value()?)),
            Short('v') | Long("verbose") => verbose = true,
            Short('h') | Long("help") => return Ok(Command::Help),
            Short('V') | Long("version") => return Ok(Command::Version),
            Value(value) if input.is_none() => input = Some(PathBuf::from(value)),
            _ => return Err(arg.unexpected()),
        }
    }

    let input = input.ok_or("missing INPUT argument")?;
    let password = password.or_else(|| env::var_os(PASSWORD_VAR));
    if let Some(password) = password {
        options.password = Some(password.into_string().map_err(|_| "password is not valid UTF-8")?.into_bytes());
    }
    Ok(Command::Run(Args { input, output, unpack, best, backup, stub_dir, verbose, options }))
}

/// Prints a usage message to `w`.
fn print_usage<W: Write + ?Sized>(w: &mut W) -> io::Result<()> {
    let codecs: Vec<&str> = CodecId::ALL.iter().map(|id| id.name()).collect();
    write!(w, "\
Usage: elfpack [OPTION]... INPUT
Compress a 64-bit Linux ELF executable, or decompress one with -d.

  -c, --codec NAME        compression codec: {} (default lz4)
      --best              try every codec and filter, keep the smallest
      --filter MODE       auto, bcj, or none (default auto)
      --password PW       ask for PW before running (also ${})
      --no-strip          keep section headers and trailing padding
      --stage0 MODE       auto, always, or never (default auto)
      --manual-reloc      relocate in the stub instead of the dynamic linker
                          for position-independent images without one
  -o, --output PATH       write here instead of replacing INPUT
      --no-backup         don't keep INPUT.bak when replacing INPUT
  -d, --unpack            decompress (default output INPUT.unpacked)
      --stub-dir DIR      where the stub binaries are (also ${})
  -v, --verbose           show what is being done
  -h, --help              show this help
  -V, --version           show the version
",
        codecs.join(", "), PASSWORD_VAR, packer::STUB_DIR_VAR,
    )
}

/// Creates `path` with mode 0755 and writes `data` to it.
fn write_executable(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).mode(0o755).open(path)?;
    file.write_all(data)?;
    file.flush()
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Packs `args.input`. Any error before writing is annotated with the input
/// path, after that with the output path.
fn pack_file(args: &Args) -> Result<(), PathError> {
    let input = fs::read(&args.input).map_err(|err| PathError::new(&args.input, err.into()))?;
    let stubs = match &args.stub_dir {
        Some(dir) => StubDir::new(dir),
        None => StubDir::from_env().map_err(|err| PathError::from(Error::from(err)))?,
    };
    let packed = if args.best {
        packer::pack_best(&input, &args.options, &stubs)
    } else {
        packer::pack(&input, &args.options, &stubs)
    }
        .map_err(|err| PathError::new(&args.input, err.into()))?;

    if packed.image_len < input.len() {
        eprintln!("{}: warning: ignoring {} bytes of section data and padding",
            args.input.display(), input.len() - packed.image_len);
    }
    if args.verbose {
        eprintln!("{}: {} -> {} bytes ({}, filter {}, {} stub of {} bytes{})",
            args.input.display(), input.len(), packed.data.len(), packed.codec, packed.filter,
            packed.linkage.name(), packed.stub_len, if packed.stage0 { ", stage-0" } else { "" });
    }

    let output = match &args.output {
        Some(output) => output.clone(),
        None => {
            if args.backup {
                let backup = with_suffix(&args.input, ".bak");
                fs::rename(&args.input, &backup).map_err(|err| PathError::new(&backup, err.into()))?;
            }
            args.input.clone()
        }
    };
    write_executable(&output, &packed.data).map_err(|err| PathError::new(&output, err.into()))
}

fn unpack_file(args: &Args) -> Result<(), PathError> {
    let input = fs::read(&args.input).map_err(|err| PathError::new(&args.input, err.into()))?;
    let image = unpack::unpack(&input).map_err(|err| PathError::new(&args.input, err.into()))?;
    let output = args.output.clone().unwrap_or_else(|| with_suffix(&args.input, ".unpacked"));
    if args.verbose {
        eprintln!("{}: {} -> {} bytes", args.input.display(), input.len(), image.len());
    }
    write_executable(&output, &image).map_err(|err| PathError::new(&output, err.into()))
}

fn main() {
    let args = match parse_args() {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            let _ = print_usage(&mut io::stdout());
            return;
        }
        Ok(Command::Version) => {
            println!("elfpack {}", env!("CARGO_PKG_VERSION"));
            return;
        }
        Err(err) => {
            let _ = print_usage(&mut io::stderr());
            eprintln!("\n{}", err);
            process::exit(1);
        }
    };

    elfpack::DEBUG.store(args.verbose, Ordering::Relaxed);
    let result = if args.unpack { unpack_file(&args) } else { pack_file(&args) };
    if let Err(err) = result {
        eprintln!("{}", err);
        process::exit(if err.err.is_soft() { 2 } else { 1 });
    }
}
