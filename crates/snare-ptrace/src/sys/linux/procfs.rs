use std::path::{Path, PathBuf};

use futures_util::TryStreamExt;
use snare_engine::{ModuleInfo, ProcessHandle};
use tokio_stream::wrappers::ReadDirStream;

use super::{Error, Result, maps};

/// Length after which the kernel truncates `/proc/<pid>/comm`.
const COMM_MAX_LEN: usize = 15;

/// Lists the processes of the system.
///
/// Processes exiting during the enumeration are skipped.
pub async fn processes() -> Result<Vec<ProcessHandle>> {
    let entries = tokio::fs::read_dir("/proc")
        .await
        .map_err(|e| Error::File("/proc".into(), e))?;

    let pids: Vec<u64> = ReadDirStream::new(entries)
        .try_filter_map(|entry| async move {
            Ok(entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()))
        })
        .try_collect()
        .await?;

    let mut processes = Vec::with_capacity(pids.len());

    for pid in pids {
        match process_name(pid).await {
            Ok(name) => processes.push(ProcessHandle::new(pid, name)),
            Err(e) => tracing::trace!(pid, error = %e, "process skipped"),
        }
    }

    Ok(processes)
}

/// Returns the name of the process with the given ID.
///
/// When `comm` is truncated, the file name of the first command-line argument
/// is used instead, provided that it extends `comm`.
async fn process_name(pid: u64) -> Result<String> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));

    let comm = read_to_string(&proc_dir.join("comm")).await?;
    let comm = comm.trim_end_matches('\n');

    if comm.len() < COMM_MAX_LEN {
        return Ok(comm.to_owned());
    }

    let cmdline = tokio::fs::read(proc_dir.join("cmdline"))
        .await
        .unwrap_or_default();

    let full_name = cmdline
        .split(|&b| b == 0)
        .next()
        .and_then(|arg0| std::str::from_utf8(arg0).ok())
        .and_then(|arg0| Path::new(arg0).file_name()?.to_str())
        .filter(|name| name.starts_with(comm));

    Ok(full_name.unwrap_or(comm).to_owned())
}

/// Returns the modules currently mapped by the process with the given ID.
pub async fn modules(pid: u64) -> Result<Vec<ModuleInfo>> {
    let content = read_to_string(Path::new(&format!("/proc/{pid}/maps"))).await?;
    maps::parse_modules(&content)
}

/// Returns whether the process with the given ID exists.
pub async fn exists(pid: u64) -> Result<bool> {
    Ok(tokio::fs::try_exists(format!("/proc/{pid}")).await?)
}

/// Lists the threads of the process with the given ID.
///
/// This runs on the tracer thread, outside of any async runtime.
pub fn threads(pid: u64) -> Result<Vec<u64>> {
    let task_dir = PathBuf::from(format!("/proc/{pid}/task"));

    let entries = std::fs::read_dir(&task_dir).map_err(|e| Error::File(task_dir.clone(), e))?;

    let mut tids = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|e| Error::File(task_dir.clone(), e))?;

        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }

    Ok(tids)
}

async fn read_to_string(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::File(path.to_owned(), e))
}
