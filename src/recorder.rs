// ===============================
// src/recorder.rs
// ===============================
//
// Audit log writer:
// - One JSON object per line, appended to the audit file.
// - BufWriter to save syscalls; flush every 1s and/or every 1000 events.
// - Creates the parent directory if missing.
// - If a write fails, reopen the file once and keep going.
// - Keeps what it wrote in memory so DUMPLOG can copy it out.
//
use std::path::Path;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::AuditEvent;

#[derive(Debug)]
pub enum RecorderMsg {
    Event(AuditEvent),
    /// Write retained events to `path`; only `user`'s when given.
    Dump { user: Option<String>, path: String },
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

async fn dump(events: &[AuditEvent], user: Option<&str>, path: &str) -> std::io::Result<usize> {
    let mut out = open_writer(path).await?;
    let mut n = 0;
    for ev in events.iter().filter(|ev| user.is_none() || ev.username() == user) {
        match serde_json::to_string(ev) {
            Ok(line) => {
                write_line(&mut out, &line).await?;
                n += 1;
            }
            Err(e) => error!(?e, "recorder: serialize error, skip event"),
        }
    }
    out.flush().await?;
    Ok(n)
}

/// Opens `path` up front so a bad audit location fails at startup, then
/// returns the task body to spawn.
pub async fn start(
    rx: mpsc::Receiver<RecorderMsg>,
    path: String,
) -> std::io::Result<impl std::future::Future<Output = ()>> {
    let writer = open_writer(&path).await?;
    Ok(run(rx, path, writer))
}

async fn run(mut rx: mpsc::Receiver<RecorderMsg>, path: String, mut writer: BufWriter<File>) {
    info!(%path, "recorder: started");
    let mut retained: Vec<AuditEvent> = Vec::new();

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_EVENTS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_msg = rx.recv() => {
                match maybe_msg {
                    Some(RecorderMsg::Event(ev)) => {
                        let line = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, "recorder: serialize error, skip event");
                                continue;
                            }
                        };

                        if let Err(e) = write_line(&mut writer, &line).await {
                            error!(?e, "recorder: write failed, attempting reopen");
                            match open_writer(&path).await {
                                Ok(w) => writer = w,
                                Err(e2) => {
                                    error!(?e2, "recorder: reopen failed, drop event");
                                    continue;
                                }
                            }
                            if let Err(e2) = write_line(&mut writer, &line).await {
                                error!(?e2, "recorder: write failed again after reopen, drop event");
                                continue;
                            }
                        }
                        retained.push(ev);

                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                            let _ = writer.flush().await;
                            since_last_flush = 0;
                        }
                    }
                    Some(RecorderMsg::Dump { user, path: out }) => {
                        match dump(&retained, user.as_deref(), &out).await {
                            Ok(n) => info!(file = %out, user = ?user, events = n, "recorder: dumplog written"),
                            Err(e) => error!(?e, file = %out, "recorder: dumplog failed"),
                        }
                    }
                    None => {
                        // Channel closed: flush and stop
                        let _ = writer.flush().await;
                        info!(events = retained.len(), "recorder: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}
