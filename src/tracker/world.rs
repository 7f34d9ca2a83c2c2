use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

pub const PREFERRED_SNAPSHOT_FILE_NAME: &str = "command_storage_zdash.dat";
const SNAPSHOT_FILE_PREFIX: &str = "command_storage_";
const SNAPSHOT_FILE_SUFFIX: &str = ".dat";

fn modified_time(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn newest_entry<F>(directory: &Path, accept: F) -> Option<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    let entries = std::fs::read_dir(directory).ok()?;
    let mut latest_match: Option<(SystemTime, PathBuf)> = None;

    for entry in entries.flatten() {
        let path = entry.path();
        if !accept(&path) {
            continue;
        }

        let modified = modified_time(&path);
        if latest_match
            .as_ref()
            .map(|(latest_time, _)| modified > *latest_time)
            .unwrap_or(true)
        {
            latest_match = Some((modified, path));
        }
    }

    latest_match.map(|(_, path)| path)
}

/// Save directory to ingest: the active world if it exists, else the newest one.
pub fn world_for_ingest(saves_dir: &Path, active_world_name: &str) -> Option<PathBuf> {
    let active_world_name = active_world_name.trim();
    if !active_world_name.is_empty() {
        let candidate = saves_dir.join(active_world_name);
        if candidate.is_dir() {
            return Some(candidate);
        }
    }

    newest_entry(saves_dir, Path::is_dir)
}

pub fn snapshot_file(world_dir: &Path) -> Option<PathBuf> {
    let data_dir = world_dir.join("data");
    let preferred = data_dir.join(PREFERRED_SNAPSHOT_FILE_NAME);
    if preferred.is_file() {
        return Some(preferred);
    }

    newest_entry(&data_dir, |path| {
        path.is_file()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    name.starts_with(SNAPSHOT_FILE_PREFIX) && name.ends_with(SNAPSHOT_FILE_SUFFIX)
                })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityWait {
    pub timeout: Duration,
    pub stable_for: Duration,
    pub poll_interval: Duration,
}

impl Default for StabilityWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(35),
            stable_for: Duration::from_millis(1_500),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Blocks the calling thread until `path` is non-empty and its size has not
/// changed for `stable_for`. Returns false once `timeout` elapses.
pub fn wait_for_stable_size(path: &Path, wait: &StabilityWait) -> bool {
    let deadline = Instant::now() + wait.timeout;
    let mut last_size: Option<u64> = None;
    let mut stable_since: Option<Instant> = None;

    while Instant::now() < deadline {
        match std::fs::metadata(path).map(|metadata| metadata.len()) {
            Ok(size) if size > 0 => {
                if last_size == Some(size) {
                    let since = *stable_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= wait.stable_for {
                        return true;
                    }
                } else {
                    stable_since = None;
                }
                last_size = Some(size);
            }
            _ => {
                stable_since = None;
                last_size = None;
            }
        }
        thread::sleep(wait.poll_interval);
    }

    false
}
