/// mpv IPC driver with separated reader/writer tasks, and the `Player`
/// implementation the channel core drives.
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← MpvRequest via mpsc, serialised → socket
///         └── reader_task   ← JSON lines from socket
///                                ├── response (has request_id) → matched oneshot
///                                └── unsolicited event         → event channel
///
///   MpvPlayer
///         └── forwarder     ← end-file reason=eof → ChannelEvent::PlayerEnded { entry }
/// ```
///
/// mpv is spawned lazily on the first load and respawned if the process
/// dies.  Unix domain socket on unix, named pipe on Windows.
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use livetv_proto::config::MpvConfig;

use crate::core::ChannelEvent;
use crate::player::Player;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `reason` of an end-file event: "eof", "stop", "error", "quit", ...
    pub fn end_reason(&self) -> Option<&str> {
        if self.event_name()? == "end-file" {
            self.raw.get("reason")?.as_str()
        } else {
            None
        }
    }

    /// Id of the playlist entry a `start-file`/`end-file` event refers to.
    pub fn playlist_entry_id(&self) -> Option<u64> {
        self.raw.get("playlist_entry_id")?.as_u64()
    }

    /// The file played out on its own, as opposed to being replaced or
    /// failing.
    pub fn is_natural_end(&self) -> bool {
        self.end_reason() == Some("eof")
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Load `url` replacing the current file, starting `start_secs` in.
    /// Returns the new entry's `playlist_entry_id` (mpv 0.33 and later).
    pub async fn load(&self, url: &str, start_secs: u64, volume: f32) -> anyhow::Result<Option<u64>> {
        // `start` is a global option; it applies to the loadfile that follows.
        self.send(json!(["set_property", "start", start_secs.to_string()]))
            .await?;
        let reply = self.send(json!(["loadfile", url, "replace"])).await?;
        let entry = reply["data"]["playlist_entry_id"].as_u64();
        let vol_pct = (volume * 100.0).clamp(0.0, 100.0);
        let _ = self.send(json!(["set_property", "volume", vol_pct])).await;
        Ok(entry)
    }

    pub async fn seek_to(&self, secs: u64) -> anyhow::Result<()> {
        self.send(json!(["seek", secs, "absolute"])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn set_fullscreen(&self, fullscreen: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "fullscreen", fullscreen]))
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and its IPC connection.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    volume: f32,
    fullscreen: bool,
}

impl MpvDriver {
    pub fn new(config: &MpvConfig) -> Self {
        Self {
            socket_name: livetv_proto::platform::mpv_socket_name(),
            process: None,
            volume: config.default_volume,
            fullscreen: config.fullscreen_on_start,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&self.socket_name).await;

        info!("mpv: spawning new process");
        let mpv_binary = livetv_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );

        let mut cmd = tokio::process::Command::new(mpv_binary);
        cmd.arg("--idle=yes")
            .arg("--force-window=immediate")
            .arg("--keep-open=no")
            .arg(livetv_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg);
        if self.fullscreen {
            cmd.arg("--fs");
        }
        let child = cmd
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(stream) = open_ipc(&self.socket_name).await {
                info!("mpv: connected to IPC");
                return Ok(start_io_tasks(stream, event_tx));
            }
        }
        anyhow::bail!("mpv IPC endpoint did not appear")
    }

    /// Reattach to our own still-running process after the IPC link dropped.
    pub async fn try_reconnect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        if !self.process_alive() {
            return None;
        }
        match open_ipc(&self.socket_name).await {
            Ok(stream) => {
                info!("mpv: reconnected to IPC");
                Some(start_io_tasks(stream, event_tx))
            }
            Err(e) => {
                warn!("mpv: failed to reconnect: {}", e);
                None
            }
        }
    }
}

#[cfg(unix)]
async fn open_ipc(name: &str) -> std::io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(name).await
}

#[cfg(windows)]
async fn open_ipc(
    name: &str,
) -> std::io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(format!(r"\\.\pipe\{}", name))
}

fn start_io_tasks<S>(stream: S, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::new(read_half);

    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let Some(tx) = pending.lock().await.remove(&req_id) else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                        continue;
                    };
                    let result = if val["error"].as_str() == Some("success") {
                        Ok(val)
                    } else {
                        let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                        debug!("mpv reader: response req={} err={}", req_id, err);
                        Err(anyhow::anyhow!("mpv error: {}", err))
                    };
                    let _ = tx.send(result);
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, &format!("mpv IPC read error: {}", e)).await;
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can always match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── Player over mpv ───────────────────────────────────────────────────────────

struct MpvSession {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
}

pub struct MpvPlayer {
    session: Mutex<MpvSession>,
    volume: f32,
    core_tx: mpsc::Sender<ChannelEvent>,
}

impl MpvPlayer {
    pub fn new(config: &MpvConfig, core_tx: mpsc::Sender<ChannelEvent>) -> Self {
        Self {
            session: Mutex::new(MpvSession {
                driver: MpvDriver::new(config),
                handle: None,
            }),
            volume: config.default_volume,
            core_tx,
        }
    }

    /// Live handle, spawning or reattaching to mpv as needed.
    async fn ensure_handle(&self) -> anyhow::Result<MpvHandle> {
        let mut session = self.session.lock().await;

        if session.handle.is_some() && !session.driver.process_alive() {
            warn!("mpv: process died, dropping handle");
            session.handle = None;
        }

        if let Some(handle) = session.handle.as_ref() {
            return Ok(handle.clone());
        }

        // One forwarder per connection; only natural ends reach the core.
        let (event_tx, mut event_rx) = mpsc::channel::<MpvEvent>(64);
        let core_tx = self.core_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = event_rx.recv().await {
                if let Some(reason) = evt.end_reason() {
                    info!(
                        "mpv: end-file reason={} entry={:?}",
                        reason,
                        evt.playlist_entry_id()
                    );
                }
                if !evt.is_natural_end() {
                    continue;
                }
                let ended = ChannelEvent::PlayerEnded {
                    entry: evt.playlist_entry_id(),
                };
                if core_tx.send(ended).await.is_err() {
                    break;
                }
            }
        });

        let handle = match session.driver.try_reconnect(event_tx.clone()).await {
            Some(h) => h,
            None => session.driver.spawn_and_connect(event_tx).await?,
        };
        session.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Handle only if mpv is already up; never spawns.
    async fn current_handle(&self) -> Option<MpvHandle> {
        self.session.lock().await.handle.clone()
    }
}

#[async_trait]
impl Player for MpvPlayer {
    async fn load(&self, source_ref: &str, start_secs: u64) -> anyhow::Result<Option<u64>> {
        let handle = self.ensure_handle().await?;
        info!("mpv: load {} at {}s", source_ref, start_secs);
        let entry = handle.load(source_ref, start_secs, self.volume).await?;
        debug!("mpv: {} is playlist entry {:?}", source_ref, entry);
        Ok(entry)
    }

    async fn seek(&self, secs: u64) -> anyhow::Result<()> {
        self.ensure_handle().await?.seek_to(secs).await
    }

    async fn play(&self) -> anyhow::Result<()> {
        self.ensure_handle().await?.set_pause(false).await
    }

    async fn pause(&self) -> anyhow::Result<()> {
        self.ensure_handle().await?.set_pause(true).await
    }

    async fn set_fullscreen(&self, fullscreen: bool) -> anyhow::Result<()> {
        {
            let mut session = self.session.lock().await;
            session.driver.fullscreen = fullscreen;
        }
        match self.current_handle().await {
            Some(handle) => handle.set_fullscreen(fullscreen).await,
            // Applied at spawn via --fs.
            None => Ok(()),
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.current_handle().await {
            let _ = handle.stop().await;
        }
        self.session.lock().await.driver.kill().await;
        Ok(())
    }
}
