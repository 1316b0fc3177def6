//! The auxiliary vector in the original stack frame.
//!
//! At entry the stack holds `argc`, the `argv` pointers and a NULL, the
//! `envp` pointers and a NULL, then `(type, value)` pairs ending with
//! `AT_NULL`.

use super::{Fatal, System};
use crate::elf::{AT_BASE, AT_ENTRY, AT_NULL, AT_PHDR, AT_PHENT, AT_PHNUM};

// Bound on the words walked, so a garbage stack can't spin forever.
const MAX_WORDS: u64 = 1 << 20;

/// Address of the first auxiliary vector entry above `sp`.
pub(super) fn find<S: System>(sys: &S, sp: u64) -> Result<u64, Fatal> {
    let word = |addr: u64| sys.read_word(addr).map_err(|_| Fatal::Mapping);
    let argc = word(sp)?;
    if argc > MAX_WORDS {
        return Err(Fatal::Mapping);
    }
    let mut p = sp + 8 * (argc + 2);
    let limit = p + 8 * MAX_WORDS;
    while word(p)? != 0 {
        p += 8;
        if p >= limit {
            return Err(Fatal::Mapping);
        }
    }
    Ok(p + 8)
}

/// The value of the first `tag` entry.
pub(super) fn get<S: System>(sys: &S, auxv: u64, tag: u64) -> Result<Option<u64>, Fatal> {
    let mut p = auxv;
    for _ in 0..MAX_WORDS {
        let t = sys.read_word(p).map_err(|_| Fatal::Mapping)?;
        if t == AT_NULL {
            return Ok(None);
        }
        if t == tag {
            return sys.read_word(p + 8).map(Some).map_err(|_| Fatal::Mapping);
        }
        p += 16;
    }
    Err(Fatal::Mapping)
}

/// New values for the entries that describe the program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Update {
    pub phdr: u64,
    pub phnum: u64,
    pub phent: u64,
    pub entry: u64,
    pub base: u64,
    /// Stored in the value slot of the `AT_NULL` terminator.
    pub terminator: Option<u64>,
}

/// Overwrites the existing entries in place. Entries the kernel didn't
/// supply are not added.
pub(super) fn rewrite<S: System>(sys: &mut S, auxv: u64, update: &Update) -> Result<(), Fatal> {
    let mut p = auxv;
    for _ in 0..MAX_WORDS {
        let tag = sys.read_word(p).map_err(|_| Fatal::Mapping)?;
        let value = match tag {
            AT_PHDR => Some(update.phdr),
            AT_PHNUM => Some(update.phnum),
            AT_PHENT => Some(update.phent),
            AT_ENTRY => Some(update.entry),
            AT_BASE => Some(update.base),
            AT_NULL => update.terminator,
            _ => None,
        };
        if let Some(value) = value {
            sys.write_word(p + 8, value).map_err(|_| Fatal::Mapping)?;
        }
        if tag == AT_NULL {
            return Ok(());
        }
        p += 16;
    }
    Err(Fatal::Mapping)
}
