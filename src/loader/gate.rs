//! The password prompt.

use super::{Fatal, System};
use crate::params::PasswordCheck;
use crate::password;

const PROMPT: &[u8] = b"Password: ";
const WRONG: &[u8] = b"Wrong password\n";
const STDIN: i32 = 0;
const STDERR: i32 = 2;

/// Prompts once and fails unless the typed line matches. There is no retry.
pub(super) fn check<S: System>(sys: &mut S, check: &PasswordCheck) -> Result<(), Fatal> {
    let _ = sys.write(STDERR, PROMPT);
    let tty = sys.open(b"/dev/tty\0").ok();
    let fd = tty.unwrap_or(STDIN);
    let echo = sys.set_echo(fd, false).ok();

    let mut buf = [0u8; 256];
    let read = sys.read(fd, &mut buf);

    if let Some(previous) = echo {
        let _ = sys.set_echo(fd, previous);
        let _ = sys.write(STDERR, b"\n");
    }
    if let Some(tty) = tty {
        sys.close(tty);
    }

    let n = read.map_err(|_| Fatal::BadPassword)?;
    let line = match buf[..n].iter().position(|&b| b == b'\n') {
        Some(end) => &buf[..end],
        None => &buf[..n],
    };
    let typed = password::trim_line(line);
    if typed.is_empty() || !password::verify(check.salt, check.obfuscated_hash, typed) {
        let _ = sys.write(STDERR, WRONG);
        return Err(Fatal::BadPassword);
    }
    Ok(())
}
