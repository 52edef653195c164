//! Cross-process lock arbitration.
//!
//! Two lock shapes: a per-volume lock taken by the cache builder while it
//! updates one volume, and a global reboot lock taken by the shutdown tool.
//! Both are held through a unix-socket connection; an EOF without a clean
//! unlock is the crash path and releases whatever the peer held.
//!
//! The wire format is newline-delimited JSON.  Replies carry an errno-style
//! status and, for the reboot lock, the first busy device.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::publisher::UpdateLock;
use crate::watcher::{Daemon, Event, GIVEUP_THRESHOLD};

/// "No status to record yet": the builder gave the lock back mid-flight.
pub(crate) const EX_TEMPFAIL: i32 = 75;

const DEFAULT_SOCKET: &str = "/run/bootstampd.sock";
/// How long a client keeps retrying a busy volume lock.
const LOCK_RETRIES: u32 = 60;

pub(crate) type ConnId = u64;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub(crate) enum Request {
    LockVolume { dev: String },
    UnlockVolume { dev: String, status: i32 },
    LockReboot,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct Reply {
    pub(crate) status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) busy_dev: Option<String>,
}

impl Reply {
    fn ok() -> Reply {
        Reply {
            status: 0,
            busy_dev: None,
        }
    }

    fn status(status: i32) -> Reply {
        Reply {
            status,
            busy_dev: None,
        }
    }
}

pub(crate) struct IpcEvent {
    pub(crate) conn: ConnId,
    pub(crate) uid: u32,
    pub(crate) kind: IpcKind,
}

pub(crate) enum IpcKind {
    Request(Request, mpsc::SyncSender<Reply>),
    Closed,
}

pub(crate) fn socket_path() -> PathBuf {
    std::env::var_os("BOOTSTAMPD_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET))
}

/// Take the listener from socket activation when present, else bind.
pub(crate) fn bind_listener() -> Result<UnixListener> {
    if let Ok(fds) = libsystemd::activation::receive_descriptors(false) {
        if let Some(fd) = fds.into_iter().next() {
            log::debug!("using socket-activated listener");
            return Ok(unsafe { UnixListener::from_raw_fd(fd.into_raw_fd()) });
        }
    }
    let path = socket_path();
    let _ = std::fs::remove_file(&path);
    UnixListener::bind(&path).with_context(|| format!("binding {}", path.display()))
}

#[cfg(target_os = "linux")]
fn peer_uid(stream: &UnixStream) -> std::io::Result<u32> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let r = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if r != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(cred.uid)
}

#[cfg(not(target_os = "linux"))]
fn peer_uid(stream: &UnixStream) -> std::io::Result<u32> {
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    let r = unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };
    if r != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(uid)
}

/// Locking is for the privileged: the superuser, or whoever the daemon
/// itself runs as.
fn privileged(uid: u32) -> bool {
    uid == 0 || uid == rustix::process::geteuid().as_raw()
}

/// Accept connections and fan each one out to a reader thread that forwards
/// requests into the daemon loop and writes replies back.
pub(crate) fn spawn_acceptor(
    listener: UnixListener,
    tx: mpsc::Sender<Event>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut next_conn: ConnId = 1;
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let conn = next_conn;
                    next_conn += 1;
                    let tx = tx.clone();
                    std::thread::spawn(move || serve_conn(conn, stream, tx));
                }
                Err(e) => {
                    log::error!("accept failed: {e}");
                    break;
                }
            }
        }
    })
}

fn serve_conn(conn: ConnId, stream: UnixStream, tx: mpsc::Sender<Event>) {
    let uid = peer_uid(&stream).unwrap_or(u32::MAX);
    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            log::error!("couldn't clone client stream: {e}");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let reply = match serde_json::from_str::<Request>(line.trim()) {
            Ok(req) => {
                let (rtx, rrx) = mpsc::sync_channel(1);
                let ev = IpcEvent {
                    conn,
                    uid,
                    kind: IpcKind::Request(req, rtx),
                };
                if tx.send(Event::Ipc(ev)).is_err() {
                    break;
                }
                match rrx.recv() {
                    Ok(reply) => reply,
                    Err(_) => break,
                }
            }
            Err(e) => {
                log::warn!("bad lock request from connection {conn}: {e}");
                Reply::status(libc::EINVAL)
            }
        };
        let Ok(mut out) = serde_json::to_string(&reply) else {
            break;
        };
        out.push('\n');
        if writer.write_all(out.as_bytes()).is_err() {
            break;
        }
    }
    // EOF or error: the lock wrapper's death path
    let _ = tx.send(Event::Ipc(IpcEvent {
        conn,
        uid,
        kind: IpcKind::Closed,
    }));
}

pub(crate) fn handle_ipc(d: &mut Daemon, ev: IpcEvent) {
    match ev.kind {
        IpcKind::Request(req, reply) => {
            let r = match req {
                Request::LockVolume { dev } => lock_volume(d, ev.conn, ev.uid, &dev),
                Request::UnlockVolume { dev, status } => {
                    unlock_volume(d, ev.conn, ev.uid, &dev, status)
                }
                Request::LockReboot => lock_reboot(d, ev.conn, ev.uid),
            };
            let _ = reply.send(r);
        }
        IpcKind::Closed => lock_died(d, ev.conn),
    }
}

pub(crate) fn lock_volume(d: &mut Daemon, conn: ConnId, uid: u32, dev: &str) -> Reply {
    if !privileged(uid) {
        log::error!("non-root doesn't need to lock or unlock volumes");
        return Reply::status(libc::EPERM);
    }
    // no new locks while a reboot is pending
    if d.reboot_lock.is_some() {
        return Reply::status(libc::EBUSY);
    }
    let Some(vol) = d.vols.get_mut(dev) else {
        return Reply::status(libc::ENOENT);
    };
    if vol.lock.is_some() {
        return Reply::status(libc::EBUSY);
    }
    vol.lock = Some(conn);

    // honor owners for the locker if the volume ignores them
    let root = vol.caches.root.clone();
    if d.disks.owners_ignored(&root).unwrap_or(false) {
        match d.disks.set_owners(dev, true) {
            Ok(()) => vol.disable_owners = true,
            Err(e) => log::warn!("couldn't enable owners on {dev}: {e:#}"),
        }
    }
    Reply::ok()
}

pub(crate) fn unlock_volume(
    d: &mut Daemon,
    conn: ConnId,
    uid: u32,
    dev: &str,
    status: i32,
) -> Reply {
    if !privileged(uid) {
        log::error!("non-root doesn't need to lock or unlock volumes");
        return Reply::status(libc::EPERM);
    }
    let Some(vol) = d.vols.get_mut(dev) else {
        log::error!("unlock for unknown volume {dev}");
        return Reply::status(libc::ENOENT);
    };
    match vol.lock {
        None => {
            log::error!("{} isn't locked", vol.caches.root);
            return Reply::status(libc::EINVAL);
        }
        Some(owner) if owner != conn => {
            log::error!("connection {conn} not used to lock {}", vol.caches.root);
            return Reply::status(libc::EINVAL);
        }
        Some(_) => {}
    }

    if status != 0 {
        if status == EX_TEMPFAIL {
            // builder not done yet; nothing to record
        } else {
            log::warn!("builder reported a problem updating {dev}");
            vol.err_count += 1;
        }
    } else if vol.err_count > 0 {
        log::info!("builder succeeded with {dev} (previously failed)");
        vol.err_count = 0;
    }

    if vol.disable_owners {
        vol.disable_owners = false;
        if let Err(e) = d.disks.set_owners(dev, false) {
            log::warn!("couldn't restore owners on {dev}: {e:#}");
        }
    }
    if let Some(vol) = d.vols.get_mut(dev) {
        vol.lock = None;
    }
    Reply::ok()
}

pub(crate) fn lock_reboot(d: &mut Daemon, conn: ConnId, uid: u32) -> Reply {
    if !privileged(uid) {
        log::error!("non-root doesn't need the reboot lock");
        return Reply::status(libc::EPERM);
    }
    if d.reboot_lock.is_some() {
        return Reply::status(libc::EBUSY);
    }

    // a newly mounted volume may still need one last update
    if let Some(busy) = reconsider_volumes(d) {
        log::info!("{busy} was busy, preventing lock for reboot");
        return Reply {
            status: libc::EBUSY,
            busy_dev: Some(busy),
        };
    }

    let devs: Vec<String> = d.vols.keys().cloned().collect();
    for dev in devs {
        let (locked, giving_up) = match d.vols.get(&dev) {
            Some(v) => (v.lock.is_some(), v.err_count >= GIVEUP_THRESHOLD),
            None => continue,
        };
        // a chronically failing volume no longer holds up shutdown
        if locked || (!giving_up && d.check_rebuild(&dev, false)) {
            log::info!("{dev} was busy, preventing lock for reboot");
            return Reply {
                status: libc::EBUSY,
                busy_dev: Some(dev),
            };
        }
    }

    d.reboot_lock = Some(conn);
    Reply::ok()
}

/// Walk the mount list for anything we should have been watching, and see
/// whether it immediately needs work.
fn reconsider_volumes(d: &mut Daemon) -> Option<String> {
    let mounts = match d.disks.local_mounts() {
        Ok(m) => m,
        Err(e) => {
            log::warn!("error while getting mount list: {e:#}");
            return None;
        }
    };
    for (dev, _root) in mounts {
        if d.vols.contains_key(&dev) {
            continue; // the caller's sweep handles these
        }
        d.vol_appeared(&dev);
        if d.vols.contains_key(&dev) && d.check_rebuild(&dev, false) {
            return Some(dev);
        }
    }
    None
}

/// The receive side went away.  Fine if the peer held nothing; otherwise
/// release the lock and restore owners.
pub(crate) fn lock_died(d: &mut Daemon, conn: ConnId) {
    if d.reboot_lock == Some(conn) {
        log::warn!("reboot client should have rebooted instead of dying");
        d.reboot_lock = None;
        return;
    }
    let holder = d
        .vols
        .iter()
        .find(|(_, v)| v.lock == Some(conn))
        .map(|(dev, _)| dev.clone());
    let Some(dev) = holder else {
        return;
    };
    log::error!("client exited without releasing lock on {dev}");
    if let Some(vol) = d.vols.get_mut(&dev) {
        if vol.disable_owners {
            vol.disable_owners = false;
            if let Err(e) = d.disks.set_owners(&dev, false) {
                log::warn!("couldn't restore owners on {dev}: {e:#}");
            }
        }
        vol.lock = None;
    }
}

/// Client side of the protocol.
pub(crate) struct ArbiterClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl ArbiterClient {
    pub(crate) fn connect(path: &Path) -> std::io::Result<ArbiterClient> {
        let stream = UnixStream::connect(path)?;
        let writer = stream.try_clone()?;
        Ok(ArbiterClient {
            writer,
            reader: BufReader::new(stream),
        })
    }

    pub(crate) fn request(&mut self, req: &Request) -> Result<Reply> {
        let mut out = serde_json::to_string(req)?;
        out.push('\n');
        self.writer.write_all(out.as_bytes())?;
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            bail!("lock arbiter hung up");
        }
        serde_json::from_str(line.trim()).context("parsing arbiter reply")
    }
}

/// The per-volume lock as held by the publisher.  Degraded gracefully: with
/// no arbiter reachable (or one that doesn't know the volume) the update
/// proceeds unlocked, as the standalone tool always has.
pub(crate) struct VolumeLock {
    client: Option<ArbiterClient>,
    dev: Option<String>,
}

impl VolumeLock {
    pub(crate) fn acquire(dev: Option<String>) -> Result<VolumeLock> {
        let Some(dev) = dev else {
            return Ok(VolumeLock {
                client: None,
                dev: None,
            });
        };
        let path = socket_path();
        let client = match ArbiterClient::connect(&path) {
            Ok(c) => c,
            Err(e) => {
                log::warn!(
                    "no lock arbiter at {}: {e}; proceeding unlocked",
                    path.display()
                );
                return Ok(VolumeLock {
                    client: None,
                    dev: None,
                });
            }
        };
        let mut lock = VolumeLock {
            client: Some(client),
            dev: Some(dev),
        };
        lock.take()?;
        Ok(lock)
    }

    fn take(&mut self) -> Result<()> {
        let (Some(client), Some(dev)) = (self.client.as_mut(), self.dev.clone()) else {
            return Ok(());
        };
        for _ in 0..LOCK_RETRIES {
            let reply = client.request(&Request::LockVolume { dev: dev.clone() })?;
            match reply.status {
                0 => return Ok(()),
                s if s == libc::EBUSY => std::thread::sleep(Duration::from_secs(1)),
                s if s == libc::ENOENT => {
                    log::warn!("lock arbiter doesn't watch {dev}; proceeding unlocked");
                    self.client = None;
                    self.dev = None;
                    return Ok(());
                }
                s => bail!("lock request for {dev} denied: status {s}"),
            }
        }
        bail!("timed out waiting for the volume lock on {dev}")
    }

    /// Report the final status and release.
    pub(crate) fn finish(mut self, status: i32) {
        if let Err(e) = self.put(status) {
            log::warn!("couldn't release volume lock: {e:#}");
        }
    }
}

impl UpdateLock for VolumeLock {
    fn put(&mut self, status: i32) -> Result<()> {
        let (Some(client), Some(dev)) = (self.client.as_mut(), self.dev.clone()) else {
            return Ok(());
        };
        client.request(&Request::UnlockVolume { dev, status })?;
        Ok(())
    }

    fn retake(&mut self) -> Result<()> {
        self.take()
    }
}

/// One-shot reboot-lock request for the shutdown path.
pub(crate) fn request_reboot_lock(client: &mut ArbiterClient) -> Result<Reply> {
    client.request(&Request::LockReboot)
}
