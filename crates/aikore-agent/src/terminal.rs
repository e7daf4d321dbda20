//! Interactive shell in an instance directory, bridged over channels.

use std::{
    io::{Read, Write},
    path::PathBuf,
    time::Duration,
};

use aikore_instance::{Instance, InstanceId};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::blueprint::BlueprintCatalog;
use crate::config::AgentConfig;
use crate::error::{InstanceError, Result};
use crate::process_support::{descendant_pids, pid_alive, signal_pid};

const PTY_READ_BUFFER_SIZE: usize = 4096;
const SHELL_KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalInput {
    Resize { rows: u16, cols: u16 },
    Data(Vec<u8>),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlFrame {
    Resize { rows: u16, cols: u16 },
}

/// A frame is a resize only if it is exactly a well-formed resize message.
/// Everything else is keystrokes.
pub fn classify_input(frame: &[u8]) -> TerminalInput {
    if frame.first() == Some(&b'{')
        && let Ok(ControlFrame::Resize { rows, cols }) = serde_json::from_slice(frame)
    {
        return TerminalInput::Resize { rows, cols };
    }
    TerminalInput::Data(frame.to_vec())
}

/// Write side of a PTY.
pub trait PtyInput: Send {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()>;
    fn resize(&mut self, rows: u16, cols: u16) -> std::io::Result<()>;
}

pub fn apply_input(pty: &mut dyn PtyInput, frame: &[u8]) -> std::io::Result<()> {
    match classify_input(frame) {
        TerminalInput::Resize { rows, cols } => pty.resize(rows, cols),
        TerminalInput::Data(data) => pty.write_all(&data),
    }
}

struct PortablePtyInput {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
}

impl PtyInput for PortablePtyInput {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn resize(&mut self, rows: u16, cols: u16) -> std::io::Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}

// Length of the prefix of `buf` that ends on a character boundary.
fn complete_utf8_prefix(buf: &[u8]) -> usize {
    match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => buf.len(),
    }
}

pub struct TerminalSession {
    instance: InstanceId,
    pid: u32,
    input: PortablePtyInput,
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
    rcfile: Option<PathBuf>,
}

impl TerminalSession {
    /// Spawns `bash` in the instance directory, activating the blueprint's
    /// interpreter environment when one is present.
    pub async fn open(
        cfg: &AgentConfig,
        catalog: &BlueprintCatalog,
        inst: &Instance,
    ) -> Result<Self> {
        let slug = inst.slug();
        let dir = cfg.instance_dir(&slug);
        tokio::fs::create_dir_all(&dir).await?;

        let activation = catalog.activation(&inst.blueprint).await;
        let rcfile = if activation.is_present(&dir) {
            tokio::fs::create_dir_all(&cfg.scratch_dir).await?;
            let path = cfg
                .scratch_dir
                .join(format!("terminal-{slug}-{}.rc", uuid::Uuid::new_v4()));
            let body = format!(
                "[ -f ~/.bashrc ] && source ~/.bashrc\n{}\n",
                activation.shell_command(&cfg.conda_root)
            );
            tokio::fs::write(&path, body).await?;
            Some(path)
        } else {
            tracing::debug!(instance = %inst.id, env = activation.env_path(), "no environment to activate");
            None
        };

        let pty = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| InstanceError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new("bash");
        if let Some(rc) = &rcfile {
            cmd.arg("--rcfile");
            cmd.arg(rc);
        }
        cmd.cwd(&dir);
        cmd.env("TERM", "xterm-256color");

        let child = pty
            .slave
            .spawn_command(cmd)
            .map_err(|e| InstanceError::Pty(e.to_string()))?;
        drop(pty.slave);
        let pid = child.process_id().unwrap_or(0);
        let reader = pty
            .master
            .try_clone_reader()
            .map_err(|e| InstanceError::Pty(e.to_string()))?;
        let writer = pty
            .master
            .take_writer()
            .map_err(|e| InstanceError::Pty(e.to_string()))?;

        tracing::info!(instance = %inst.id, pid, activated = rcfile.is_some(), "terminal session opened");
        Ok(Self {
            instance: inst.id.clone(),
            pid,
            input: PortablePtyInput {
                master: pty.master,
                writer,
            },
            reader,
            child,
            rcfile,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Bridges the PTY until either side finishes, then tears the shell down.
    ///
    /// Output chunks never split a UTF-8 sequence. Bytes that are not UTF-8
    /// are passed through untouched.
    pub async fn run(
        self,
        mut input: mpsc::Receiver<Vec<u8>>,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<()> {
        let Self {
            instance,
            pid,
            input: mut pty_input,
            mut reader,
            mut child,
            rcfile,
        } = self;
        let cancel = CancellationToken::new();

        let reader_task = tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            move || {
                let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
                let mut pending: Vec<u8> = Vec::new();
                loop {
                    let n = match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    pending.extend_from_slice(&buf[..n]);
                    let ready = complete_utf8_prefix(&pending);
                    if ready == 0 {
                        continue;
                    }
                    let chunk: Vec<u8> = pending.drain(..ready).collect();
                    if output.blocking_send(chunk).is_err() {
                        break;
                    }
                }
                if !pending.is_empty() {
                    let _ = output.blocking_send(pending);
                }
                cancel.cancel();
            }
        });

        let mut write_error = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = input.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = apply_input(&mut pty_input, &frame) {
                        write_error = Some(InstanceError::Pty(e.to_string()));
                        break;
                    }
                }
            }
        }
        cancel.cancel();

        // Collect before the shell dies and its children are reparented.
        let mut pids = descendant_pids(pid);
        drop(pty_input);
        terminate_shell(&mut *child, pid, &mut pids).await;

        if let Err(e) = reader_task.await {
            tracing::warn!(instance = %instance, error = %e, "terminal reader panicked");
        }
        if let Some(rc) = rcfile {
            let _ = tokio::fs::remove_file(rc).await;
        }
        tracing::info!(instance = %instance, pid, "terminal session closed");
        match write_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn terminate_shell(child: &mut (dyn Child + Send + Sync), pid: u32, descendants: &mut Vec<u32>) {
    if pid != 0 {
        let _ = signal_pid(pid, libc::SIGTERM);
    }
    for &p in descendants.iter() {
        let _ = signal_pid(p, libc::SIGTERM);
    }

    let deadline = tokio::time::Instant::now() + SHELL_KILL_WAIT;
    loop {
        let shell_done = matches!(child.try_wait(), Ok(Some(_)));
        descendants.retain(|&p| pid_alive(p));
        if shell_done && descendants.is_empty() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if !matches!(child.try_wait(), Ok(Some(_))) {
        let _ = child.kill();
        let _ = child.wait();
    }
    for &p in descendants.iter() {
        let _ = signal_pid(p, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingPty {
        written: Vec<u8>,
        resizes: Vec<(u16, u16)>,
    }

    impl PtyInput for RecordingPty {
        fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn resize(&mut self, rows: u16, cols: u16) -> std::io::Result<()> {
            self.resizes.push((rows, cols));
            Ok(())
        }
    }

    #[test]
    fn resize_frames_never_reach_the_shell() {
        let mut pty = RecordingPty::default();
        apply_input(&mut pty, br#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
        assert_eq!(pty.resizes, vec![(40, 120)]);
        assert!(pty.written.is_empty());
    }

    #[test]
    fn keystrokes_are_written_verbatim() {
        let mut pty = RecordingPty::default();
        apply_input(&mut pty, b"ls -la\n").unwrap();
        assert_eq!(pty.written, b"ls -la\n");
        assert!(pty.resizes.is_empty());
    }

    #[test]
    fn malformed_control_frames_are_treated_as_input() {
        for frame in [
            &br#"{"type":"resize","rows":"40","cols":120}"#[..],
            br#"{"type":"resize","rows":40}"#,
            br#"{"type":"input","data":"x"}"#,
            br#"{not json"#,
        ] {
            assert_eq!(classify_input(frame), TerminalInput::Data(frame.to_vec()));
        }
    }

    #[test]
    fn utf8_prefix_holds_back_split_characters() {
        let s = "aé".as_bytes();
        assert_eq!(complete_utf8_prefix(s), 3);
        assert_eq!(complete_utf8_prefix(&s[..2]), 1);
        assert_eq!(complete_utf8_prefix(b"\xff\xfe"), 2);
    }

    #[tokio::test]
    async fn shell_round_trip_and_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig::rooted(dir.path());
        let catalog = BlueprintCatalog::new(&cfg.stock_blueprints_dir, &cfg.custom_blueprints_dir);
        let inst = Instance::new("term test", "none.sh");

        let session = TerminalSession::open(&cfg, &catalog, &inst).await.unwrap();
        let pid = session.pid();
        assert_ne!(pid, 0);

        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let run = tokio::spawn(session.run(in_rx, out_tx));

        in_tx
            .send(br#"{"type":"resize","rows":40,"cols":120}"#.to_vec())
            .await
            .unwrap();
        in_tx.send(b"echo marker-$((40+2))\n".to_vec()).await.unwrap();
        in_tx.send(b"printf 'raw-\\377-end\\n'\n".to_vec()).await.unwrap();

        let mut seen: Vec<u8> = Vec::new();
        let contains = |hay: &[u8], needle: &[u8]| hay.windows(needle.len()).any(|w| w == needle);
        let found = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(chunk) = out_rx.recv().await {
                seen.extend_from_slice(&chunk);
                if contains(&seen, b"marker-42") && contains(&seen, b"raw-\xff-end") {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found, "shell output: {:?}", String::from_utf8_lossy(&seen));

        drop(in_tx);
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!pid_alive(pid));
    }
}
