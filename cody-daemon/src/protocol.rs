use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request.
///
/// `cmd` is one of `commit`, `status`, `drain`, `stop`. `commit` takes a
/// repository, an optional branch (default `main`) and an optional commit id
/// (default: the branch head).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl DaemonRequest {
    pub fn command(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            ..Default::default()
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Attempts `request_status` makes while a just-started daemon binds its
/// socket.
const STATUS_ATTEMPTS: u32 = 5;
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Send one JSON request to the daemon socket and read one response line.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    let mut stream = connect(&socket)?;

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stream
        .write_all(&line)
        .and_then(|()| stream.flush())
        .map_err(|e| io_err(&socket, e))?;

    let mut reply = String::new();
    let read = BufReader::new(stream)
        .read_line(&mut reply)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }
    Ok(serde_json::from_str(reply.trim_end())?)
}

/// A missing socket or a refused connection both mean no daemon is
/// listening.
fn connect(socket: &Path) -> Result<UnixStream, DaemonError> {
    let not_running = || DaemonError::DaemonNotRunning {
        socket: socket.to_path_buf(),
    };
    if !socket.exists() {
        return Err(not_running());
    }
    UnixStream::connect(socket).map_err(|err| match err.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
            not_running()
        }
        _ => io_err(socket, err),
    })
}

fn call(home: &Path, request: &DaemonRequest) -> Result<Value, DaemonError> {
    response_into_data(send_request(home, request)?)
}

/// Daemon status, retrying briefly while a just-started daemon binds its
/// socket.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::command("status");
    let mut attempt = 1;
    loop {
        match call(home, &request) {
            Err(DaemonError::DaemonNotRunning { .. }) if attempt < STATUS_ATTEMPTS => {
                attempt += 1;
                sleep(STATUS_RETRY_DELAY);
            }
            result => return result,
        }
    }
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    call(home, &DaemonRequest::command("stop")).map(|_| ())
}

/// Submit a commit event; returns the ingest summary once the daemon has
/// staged (or directly published) it.
pub fn request_commit(
    home: &Path,
    repository: &str,
    branch: Option<&str>,
    commit: Option<&str>,
) -> Result<Value, DaemonError> {
    call(
        home,
        &DaemonRequest {
            cmd: "commit".to_string(),
            repository: Some(repository.to_string()),
            branch: branch.map(str::to_string),
            commit: commit.map(str::to_string),
        },
    )
}

/// Ask the daemon to start a drain trampoline.
pub fn request_drain(home: &Path) -> Result<Value, DaemonError> {
    call(home, &DaemonRequest::command("drain"))
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    match response {
        DaemonResponse { ok: true, data, .. } => Ok(data.unwrap_or(Value::Null)),
        DaemonResponse { error, .. } => Err(DaemonError::Protocol(
            error.unwrap_or_else(|| "unknown daemon error".to_string()),
        )),
    }
}
