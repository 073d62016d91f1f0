// Operator Console
//
// A line-oriented command set that drives one FileSystemView per session.
// Every command acquires the handles it needs and releases them before
// replying, the way an FTP command handler would.

pub mod server;

use std::fmt;
use std::io::{Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::fsal::{FileSystemView, FsalError, FtpFile};

pub use server::{serve_session, ConsoleServer};

/// Reply to a single console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Success with a one-line message
    Ok(String),
    /// Success with one line per entry
    Listing(Vec<String>),
    Err(String),
    /// Session ends
    Bye,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(message) if message.is_empty() => write!(f, "ok"),
            Reply::Ok(message) => write!(f, "ok {}", message),
            Reply::Listing(lines) => {
                for line in lines {
                    writeln!(f, "{}", line)?;
                }
                write!(f, "ok {} entries", lines.len())
            }
            Reply::Err(message) => write!(f, "err {}", message),
            Reply::Bye => write!(f, "bye"),
        }
    }
}

/// Run one command line against a session view
pub fn execute(view: &mut dyn FileSystemView, line: &str) -> Reply {
    let line = line.trim();
    let (command, args) = match line.split_once(char::is_whitespace) {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    };
    debug!("CONSOLE: {} {:?}", command, args);

    match command.to_ascii_lowercase().as_str() {
        "pwd" => Reply::Ok(view.working_path().to_string()),
        "cd" => change_directory(view, args),
        "cdup" => change_directory(view, ".."),
        "ls" => list(view, if args.is_empty() { "." } else { args }),
        "stat" => stat(view, args),
        "mkdir" => make_directory(view, args),
        "rm" => remove(view, args),
        "mv" => rename(view, args),
        "put" => store(view, args, false),
        "append" => store(view, args, true),
        "cat" => retrieve(view, args),
        "touch" => touch(view, args),
        "quit" => Reply::Bye,
        "" => Reply::Err("empty command".to_string()),
        other => Reply::Err(format!("unknown command {}", other)),
    }
}

/// Resolve `path`, run `f` on the handle and release it
fn with_file<T>(
    view: &mut dyn FileSystemView,
    path: &str,
    f: impl FnOnce(&mut dyn FtpFile) -> T,
) -> Option<T> {
    let id = view.get_file(path)?;
    let result = view.file_mut(id).map(f);
    view.release_file(id);
    result
}

fn unresolved(path: &str) -> Reply {
    Reply::Err(format!("cannot resolve {}", path))
}

fn missing_argument(what: &str) -> Reply {
    Reply::Err(format!("missing {}", what))
}

/// One listing line: kind+permissions, links, owner, group, size, name
fn describe(file: &dyn FtpFile) -> String {
    let kind = if file.is_directory() { 'd' } else { '-' };
    let read = if file.is_readable() { 'r' } else { '-' };
    let write = if file.is_writable() { 'w' } else { '-' };
    format!(
        "{}{}{} {} {} {} {} {}",
        kind,
        read,
        write,
        file.link_count(),
        file.owner(),
        file.group(),
        file.size(),
        file.name()
    )
}

fn change_directory(view: &mut dyn FileSystemView, path: &str) -> Reply {
    if path.is_empty() {
        return missing_argument("path");
    }
    if view.change_working_directory(path) {
        Reply::Ok(view.working_path().to_string())
    } else {
        Reply::Err(format!("cannot change to {}", path))
    }
}

fn list(view: &mut dyn FileSystemView, path: &str) -> Reply {
    let Some(dir) = view.get_file(path) else {
        return unresolved(path);
    };
    let listing = view.list_files(dir);
    view.release_file(dir);

    let Some(ids) = listing else {
        return Reply::Err(format!("{} is not a directory", path));
    };
    let lines = ids
        .iter()
        .filter_map(|id| view.file(*id).map(describe))
        .collect();
    for id in ids {
        view.release_file(id);
    }
    Reply::Listing(lines)
}

fn stat(view: &mut dyn FileSystemView, path: &str) -> Reply {
    if path.is_empty() {
        return missing_argument("path");
    }
    let found = with_file(view, path, |file| {
        if !file.exists() {
            return None;
        }
        let modified = file
            .last_modified()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |since| since.as_secs());
        Some(format!("{} {} {}", describe(file), file.absolute_path(), modified))
    });
    match found {
        Some(Some(line)) => Reply::Ok(line),
        Some(None) => Reply::Err(format!("no such file {}", path)),
        None => unresolved(path),
    }
}

fn make_directory(view: &mut dyn FileSystemView, path: &str) -> Reply {
    if path.is_empty() {
        return missing_argument("path");
    }
    match with_file(view, path, |file| file.mkdir()) {
        Some(true) => Reply::Ok(String::new()),
        Some(false) => Reply::Err(format!("cannot create {}", path)),
        None => unresolved(path),
    }
}

fn remove(view: &mut dyn FileSystemView, path: &str) -> Reply {
    if path.is_empty() {
        return missing_argument("path");
    }
    match with_file(view, path, |file| file.delete()) {
        Some(true) => Reply::Ok(String::new()),
        Some(false) => Reply::Err(format!("cannot remove {}", path)),
        None => unresolved(path),
    }
}

fn rename(view: &mut dyn FileSystemView, args: &str) -> Reply {
    let Some((from, to)) = args.split_once(char::is_whitespace) else {
        return missing_argument("destination");
    };
    let to = to.trim();

    let Some(source) = view.get_file(from) else {
        return unresolved(from);
    };
    let Some(dest) = view.get_file(to) else {
        view.release_file(source);
        return unresolved(to);
    };

    let moved = view.move_file(source, dest);
    view.release_file(source);
    view.release_file(dest);

    if moved {
        Reply::Ok(String::new())
    } else {
        Reply::Err(format!("cannot move {} to {}", from, to))
    }
}

/// Write the rest of the line into a file, truncating or appending
fn store(view: &mut dyn FileSystemView, args: &str, append: bool) -> Reply {
    let (path, text) = match args.split_once(char::is_whitespace) {
        Some((path, text)) => (path, text),
        None => (args, ""),
    };
    if path.is_empty() {
        return missing_argument("path");
    }

    let written = with_file(view, path, |file| -> Result<usize, FsalError> {
        let offset = if append && file.exists() { file.size() } else { 0 };
        let mut writer = file.open_write(offset)?;
        writer
            .write_all(text.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| FsalError::io(path, e))?;
        Ok(text.len())
    });

    match written {
        Some(Ok(len)) => Reply::Ok(format!("{} bytes", len)),
        Some(Err(e)) => Reply::Err(e.to_string()),
        None => unresolved(path),
    }
}

fn retrieve(view: &mut dyn FileSystemView, args: &str) -> Reply {
    let mut parts = args.split_whitespace();
    let Some(path) = parts.next() else {
        return missing_argument("path");
    };
    let offset = match parts.next().map(str::parse::<u64>) {
        None => 0,
        Some(Ok(offset)) => offset,
        Some(Err(_)) => return Reply::Err("invalid offset".to_string()),
    };

    let read = with_file(view, path, |file| -> Result<Vec<u8>, FsalError> {
        if file.is_directory() {
            return Err(FsalError::IsADirectory(file.absolute_path().to_string()));
        }
        let mut reader = file.open_read(offset)?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| FsalError::io(path, e))?;
        Ok(data)
    });

    match read {
        Some(Ok(data)) => Reply::Ok(String::from_utf8_lossy(&data).escape_debug().to_string()),
        Some(Err(e)) => Reply::Err(e.to_string()),
        None => unresolved(path),
    }
}

fn touch(view: &mut dyn FileSystemView, args: &str) -> Reply {
    let Some((path, secs)) = args.split_once(char::is_whitespace) else {
        return missing_argument("timestamp");
    };
    let Ok(secs) = secs.trim().parse::<u64>() else {
        return Reply::Err("invalid timestamp".to_string());
    };
    let time: SystemTime = UNIX_EPOCH + Duration::from_secs(secs);

    match with_file(view, path, |file| file.set_last_modified(time)) {
        Some(true) => Reply::Ok(String::new()),
        Some(false) => Reply::Err(format!("cannot set time on {}", path)),
        None => unresolved(path),
    }
}
