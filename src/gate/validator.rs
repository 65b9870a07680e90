//! Client-side validator for commands sent to golden images.
//!
//! Before any command leaves this host for a source VM it is parsed and
//! checked against an allowlist of read-only tools. This is the first half
//! of a defense-in-depth pair; the second half is the restricted shell
//! installed on the image itself (see [`super::shell`]). The client list is
//! authoritative for what can be *sent*; the server shell for what can
//! *execute* if this layer is bypassed.

use crate::error::{Error, Result};

/// Commands that only inspect state. Anything not listed is rejected.
const ALLOWED_COMMANDS: &[&str] = &[
    // file inspection
    "cat", "head", "tail", "less", "more", "file", "stat", "ls", "find", "readlink", "realpath",
    "du", "tree", "diff", "md5sum", "sha1sum", "sha256sum", "base64", "xxd", "hexdump", "od",
    "strings",
    // process / system inspection
    "ps", "pgrep", "pstree", "free", "uptime", "vmstat", "iostat", "lsof", "w", "last", "dmesg",
    "journalctl",
    // network inspection
    "ss", "netstat", "ip", "ping", "traceroute", "host", "dig", "nslookup",
    // disk inspection
    "df", "lsblk", "blkid", "findmnt",
    // package queries
    "dpkg", "apt", "apt-cache", "pip", "pip3", "snap",
    // system info
    "uname", "date", "id", "whoami", "groups", "lscpu", "lsmem", "lspci", "lsusb", "locale",
    "hostnamectl", "timedatectl", "systemctl",
    // pipe-safe text filters
    "grep", "egrep", "fgrep", "zgrep", "cut", "sort", "uniq", "tr", "wc", "column", "paste",
    "join", "comm", "nl", "tac", "rev", "fold", "expand", "jq", "echo", "printf", "true",
];

/// Tools that are read-only by default but grow write/exec powers through
/// specific arguments. Any listed argument anywhere in the invocation is
/// rejected; quotes are stripped first so `'-exec'` cannot slip past.
const FORBIDDEN_ARGUMENTS: &[(&str, &[&str])] = &[(
    "find",
    &[
        "-exec", "-execdir", "-ok", "-okdir", "-delete", "-fprintf", "-fprint", "-fprint0",
        "-fls",
    ],
)];

/// Tools that are only read-only for a subset of their subcommands. The
/// first real argument must appear here or the command is rejected.
const ALLOWED_SUBCOMMANDS: &[(&str, &[&str])] = &[
    ("systemctl", &["status", "show", "list-units", "is-active", "is-enabled"]),
    ("apt", &["list"]),
    ("dpkg", &["-l", "--list"]),
    ("pip", &["list"]),
    ("pip3", &["list"]),
    ("snap", &["list"]),
    ("ip", &["addr", "a", "route", "r", "neigh", "n", "-br"]),
    ("hostnamectl", &["status"]),
    ("timedatectl", &["status"]),
];

/// Validate that `command` is a read-only pipeline.
///
/// Rejection reasons name the violated constraint so callers can surface
/// them verbatim.
pub fn validate_read_only(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(Error::invalid_input("empty command"));
    }

    scan_unquoted(command)?;

    for segment in split_segments(command) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        validate_segment(segment)?;
    }
    Ok(())
}

/// Reject shell constructs that smuggle execution or writes, anywhere they
/// appear outside single or double quotes.
fn scan_unquoted(command: &str) -> Result<()> {
    let bytes = command.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_single {
            if c == '\'' {
                in_single = false;
            }
        } else if in_double {
            if c == '"' && (i == 0 || bytes[i - 1] != b'\\') {
                in_double = false;
            }
        } else {
            match c {
                '\'' => in_single = true,
                '"' => in_double = true,
                '`' => {
                    return Err(Error::invalid_input("command substitution is not allowed"));
                }
                '$' if bytes.get(i + 1) == Some(&b'(') => {
                    return Err(Error::invalid_input("command substitution is not allowed"));
                }
                '<' if bytes.get(i + 1) == Some(&b'(') => {
                    return Err(Error::invalid_input("process substitution is not allowed"));
                }
                '>' if bytes.get(i + 1) == Some(&b'(') => {
                    return Err(Error::invalid_input("process substitution is not allowed"));
                }
                '>' => {
                    return Err(Error::invalid_input("output redirection is not allowed"));
                }
                '\n' | '\r' => {
                    return Err(Error::invalid_input("raw newline is not allowed"));
                }
                _ => {}
            }
        }
        i += 1;
    }
    Ok(())
}

/// Split on unquoted `|`, `&`, `;`. `||` and `&&` fall out naturally as
/// empty segments, which callers skip.
fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut prev = '\0';
    for c in command.chars() {
        if in_single {
            if c == '\'' {
                in_single = false;
            }
            current.push(c);
        } else if in_double {
            if c == '"' && prev != '\\' {
                in_double = false;
            }
            current.push(c);
        } else {
            match c {
                '\'' => {
                    in_single = true;
                    current.push(c);
                }
                '"' => {
                    in_double = true;
                    current.push(c);
                }
                '|' | '&' | ';' => {
                    segments.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            }
        }
        prev = c;
    }
    segments.push(current);
    segments
}

fn validate_segment(segment: &str) -> Result<()> {
    let tokens: Vec<&str> = segment.split_whitespace().collect();

    // Skip leading KEY=VALUE environment assignments.
    let mut idx = 0;
    while idx < tokens.len() && is_env_assignment(tokens[idx]) {
        idx += 1;
    }
    let Some(first) = tokens.get(idx) else {
        return Err(Error::invalid_input(format!(
            "segment has no command: {segment}"
        )));
    };
    idx += 1;

    // A directory prefix never changes what the tool is.
    let program = first.rsplit('/').next().unwrap_or(first);

    if !ALLOWED_COMMANDS.contains(&program) {
        return Err(Error::invalid_input(format!(
            "command '{program}' is not in the read-only allowlist"
        )));
    }

    if let Some((_, allowed)) = ALLOWED_SUBCOMMANDS.iter().find(|(cmd, _)| *cmd == program) {
        match tokens.get(idx) {
            Some(sub) if allowed.contains(sub) => idx += 1,
            Some(sub) => {
                return Err(Error::invalid_input(format!(
                    "subcommand not allowed: {program} {sub}"
                )));
            }
            None => {
                return Err(Error::invalid_input(format!(
                    "subcommand not allowed: {program} requires one of {allowed:?}"
                )));
            }
        }
    }

    if let Some((_, banned)) = FORBIDDEN_ARGUMENTS.iter().find(|(cmd, _)| *cmd == program) {
        for token in &tokens[idx..] {
            // The shell concatenates quoted pieces, so compare with quote
            // characters removed.
            let bare: String = token.chars().filter(|c| !matches!(c, '\'' | '"')).collect();
            if banned.contains(&bare.as_str()) {
                return Err(Error::invalid_input(format!(
                    "argument not allowed: {program} {bare}"
                )));
            }
        }
    }

    Ok(())
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((key, _)) => {
            !key.is_empty()
                && key
                    .chars()
                    .enumerate()
                    .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
        }
        None => false,
    }
}
