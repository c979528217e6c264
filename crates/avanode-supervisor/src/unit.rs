//! systemd unit rendering and managed-deployment detection.
//!
//! The marker line is the only signal used to decide whether this tool owns
//! a deployment. A hand-written unit with an identical layout but no marker
//! is treated as unmanaged.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Sentinel written into every unit file this tool renders
pub const MANAGED_MARKER: &str = "# Managed-By: avanode";

/// Mode for unit files under /etc/systemd/system
const UNIT_FILE_MODE: u32 = 0o644;

/// Inputs for rendering the node's service definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub description: String,
    pub user: String,
    pub group: String,
    pub working_dir: PathBuf,
    pub exec: PathBuf,
    pub args: Vec<String>,
    pub limit_nofile: u64,
}

impl UnitSpec {
    pub fn render(&self) -> String {
        let mut exec_start = escape_exec_arg(&self.exec.to_string_lossy());
        for arg in &self.args {
            exec_start.push(' ');
            exec_start.push_str(&escape_exec_arg(arg));
        }

        format!(
            "{marker}\n\
             # Changes to this file are overwritten on install and upgrade.\n\
             [Unit]\n\
             Description={description}\n\
             After=network-online.target\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             User={user}\n\
             Group={group}\n\
             WorkingDirectory={workdir}\n\
             ExecStart={exec_start}\n\
             LimitNOFILE={nofile}\n\
             Restart=always\n\
             RestartSec=5\n\
             TimeoutStopSec=300\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            marker = MANAGED_MARKER,
            description = self.description,
            user = self.user,
            group = self.group,
            workdir = self.working_dir.display(),
            exec_start = exec_start,
            nofile = self.limit_nofile,
        )
    }
}

/// True when the unit text carries this tool's marker line.
pub fn is_managed(unit_text: &str) -> bool {
    unit_text.lines().any(|line| line.trim() == MANAGED_MARKER)
}

/// Program launched by the unit's `ExecStart=` line.
///
/// Handles systemd's special prefixes (`-`, `@`, `+`, `!`, `:`) and a quoted
/// program path. Used to find the node binary of a hand-written unit.
pub fn exec_program(unit_text: &str) -> Option<PathBuf> {
    let line = unit_text
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("ExecStart="))?;
    let line = line.trim_start_matches(['-', '@', '+', '!', ':']).trim_start();

    let program = match line.strip_prefix('"') {
        Some(rest) => rest.split('"').next()?,
        None => line.split_whitespace().next()?,
    };
    if program.is_empty() {
        None
    } else {
        Some(PathBuf::from(program))
    }
}

/// Quote one ExecStart argument for systemd's command-line parser.
///
/// Plain arguments pass through. Anything with whitespace, quotes or a
/// backslash is double-quoted; `%` and `$` are doubled so systemd does not
/// expand them as specifiers or variables.
pub fn escape_exec_arg(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '\\' || c == ';');

    let mut escaped = String::with_capacity(arg.len() + 2);
    if needs_quotes {
        escaped.push('"');
    }
    for c in arg.chars() {
        match c {
            '%' => escaped.push_str("%%"),
            '$' => escaped.push_str("$$"),
            '"' if needs_quotes => escaped.push_str("\\\""),
            '\\' if needs_quotes => escaped.push_str("\\\\"),
            other => escaped.push(other),
        }
    }
    if needs_quotes {
        escaped.push('"');
    }
    escaped
}

/// Read a unit file, `None` if it does not exist.
pub fn read_unit(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replace the unit file atomically (write sibling, then rename).
pub fn write_unit(path: &Path, text: &str) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unit path has no parent"))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unit path has no file name"))?;
    let tmp = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));

    let written = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(UNIT_FILE_MODE)
            .open(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(UNIT_FILE_MODE))?;
        fs::rename(&tmp, path)
    })();

    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}
