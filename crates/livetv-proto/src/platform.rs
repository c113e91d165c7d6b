use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9877;

#[cfg(unix)]
pub fn mpv_socket_name() -> String {
    format!("{}/livetv-mpv.sock", std::env::temp_dir().display())
}

#[cfg(windows)]
pub fn mpv_socket_name() -> String {
    "livetv-mpv".to_string()
}

#[cfg(unix)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server={}", mpv_socket_name())
}

#[cfg(windows)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name())
}

pub fn data_dir() -> PathBuf {
    // XDG-style on every unix, including macOS
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("livetv")
    }
    #[cfg(windows)]
    {
        if let Some(dir) = portable_dir("data") {
            return dir;
        }
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("livetv")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("livetv")
    }
    #[cfg(windows)]
    {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                if exe_dir.join("config.toml").exists() {
                    return exe_dir.to_path_buf();
                }
            }
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("livetv")
    }
}

#[cfg(windows)]
fn portable_dir(name: &str) -> Option<PathBuf> {
    let exe_path = std::env::current_exe().ok()?;
    let dir = exe_path.parent()?.join(name);
    dir.exists().then_some(dir)
}

#[cfg(unix)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv"]
}

#[cfg(windows)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv.exe", "mpv"]
}

#[cfg(unix)]
fn ffprobe_binary_names() -> &'static [&'static str] {
    &["ffprobe"]
}

#[cfg(windows)]
fn ffprobe_binary_names() -> &'static [&'static str] {
    &["ffprobe.exe", "ffprobe"]
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
        let p = dir.join("external").join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in names {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Find the mpv binary: `MPV_PATH`, then beside the executable, then PATH.
pub fn find_mpv_binary() -> Option<PathBuf> {
    if let Some(p) = env_override("MPV_PATH") {
        return Some(p);
    }
    find_beside_exe(mpv_binary_names()).or_else(|| find_on_path(mpv_binary_names()))
}

/// Find ffprobe for header-only duration probing.
pub fn find_ffprobe_binary() -> Option<PathBuf> {
    if let Some(p) = env_override("FFPROBE_PATH") {
        return Some(p);
    }
    find_beside_exe(ffprobe_binary_names()).or_else(|| find_on_path(ffprobe_binary_names()))
}

fn env_override(var: &str) -> Option<PathBuf> {
    let p = PathBuf::from(std::env::var_os(var)?);
    p.exists().then_some(p)
}
