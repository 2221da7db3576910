use crate::model::ReplicationDirection;
use crate::sys::once_regex;
use crate::sys::process::verdict;
use crate::sys::shell::{classify_ssh_error, shell_join, LocalShell, Shell, SshShell};
use anyhow::{anyhow, Context as AnyhowContext, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use uuid::Uuid;

pub type ProgressObserver = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Everything the transport needs to build one send/receive pipeline.
#[derive(Debug, Clone)]
pub struct ReplicationProcessSpec {
    pub task_id: Uuid,
    pub direction: ReplicationDirection,
    pub src_dataset: String,
    pub dst_dataset: String,
    pub snapshot: Option<String>,
    pub incremental_base: Option<String>,
    pub receive_resume_token: Option<String>,
    pub replicate: bool,
    pub properties: bool,
    pub properties_exclude: Vec<String>,
    pub properties_override: BTreeMap<String, String>,
    pub compression: Option<String>,
    pub speed_limit: Option<u64>,
    pub dedup: bool,
    pub large_block: bool,
    pub embed: bool,
    pub compressed: bool,
    pub encrypted_source: bool,
}

#[async_trait]
pub trait ReplicationProcess: Send {
    fn add_progress_observer(&mut self, observer: ProgressObserver);
    async fn run(&mut self) -> Result<()>;
}

pub trait Transport: Send + Sync {
    fn shell(&self) -> Arc<dyn Shell>;
    fn replication_process(&self, spec: ReplicationProcessSpec) -> Result<Box<dyn ReplicationProcess>>;
}

/// Replication against a remote host over ssh. The remote half of the
/// pipeline runs as a command string under the remote login shell so a
/// wire compressor can be spliced in without a second connection.
pub struct SshTransport {
    connect_args: Vec<String>,
    shell: Arc<SshShell>,
}

impl SshTransport {
    pub fn new(connect_args: Vec<String>) -> Self {
        Self {
            shell: Arc::new(SshShell::new(connect_args.clone())),
            connect_args,
        }
    }
}

impl Transport for SshTransport {
    fn shell(&self) -> Arc<dyn Shell> {
        Arc::clone(&self.shell) as Arc<dyn Shell>
    }

    fn replication_process(&self, spec: ReplicationProcessSpec) -> Result<Box<dyn ReplicationProcess>> {
        Ok(Box::new(PipeReplicationProcess::new(Some(self.connect_args.clone()), spec)))
    }
}

/// Both endpoints on this machine. Mostly useful for pool-to-pool
/// replication and for exercising the pipeline without a network.
pub struct LocalTransport {
    shell: Arc<LocalShell>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            shell: Arc::new(LocalShell::default()),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalTransport {
    fn shell(&self) -> Arc<dyn Shell> {
        Arc::clone(&self.shell) as Arc<dyn Shell>
    }

    fn replication_process(&self, spec: ReplicationProcessSpec) -> Result<Box<dyn ReplicationProcess>> {
        Ok(Box::new(PipeReplicationProcess::new(None, spec)))
    }
}

struct PipeReplicationProcess {
    remote_connect: Option<Vec<String>>,
    spec: ReplicationProcessSpec,
    observers: Vec<ProgressObserver>,
}

impl PipeReplicationProcess {
    fn new(remote_connect: Option<Vec<String>>, spec: ReplicationProcessSpec) -> Self {
        Self {
            remote_connect,
            spec,
            observers: Vec::default(),
        }
    }

    fn send_args(&self) -> Result<Vec<String>> {
        let spec = &self.spec;
        let mut args: Vec<String> = vec!["zfs".into(), "send".into()];
        if spec.replicate {
            args.push("-R".into());
        }
        if spec.properties && !spec.replicate {
            args.push("-p".into());
        }
        if spec.large_block {
            args.push("-L".into());
        }
        if spec.embed {
            args.push("-e".into());
        }
        if spec.compressed {
            args.push("-c".into());
        }
        if spec.dedup {
            args.push("-D".into());
        }
        if spec.encrypted_source {
            // Encrypted datasets travel raw so the destination never sees
            // the key.
            args.push("-w".into());
        }
        match &spec.receive_resume_token {
            Some(token) => {
                args.push("-t".into());
                args.push(token.clone());
            }
            None => {
                let snapshot = spec
                    .snapshot
                    .as_ref()
                    .ok_or_else(|| anyhow!("snapshot required for a non-resume send"))?;
                if let Some(base) = &spec.incremental_base {
                    args.push("-i".into());
                    args.push(format!("{}@{}", spec.src_dataset, base));
                }
                args.push(format!("{}@{}", spec.src_dataset, snapshot));
            }
        }
        Ok(args)
    }

    fn recv_args(&self) -> Vec<String> {
        let spec = &self.spec;
        let mut args: Vec<String> = vec!["zfs".into(), "receive".into(), "-s".into(), "-F".into()];
        for property in &spec.properties_exclude {
            args.push("-x".into());
            args.push(property.clone());
        }
        for (property, value) in &spec.properties_override {
            args.push("-o".into());
            args.push(format!("{}={}", property, value));
        }
        args.push(spec.dst_dataset.clone());
        args
    }

    fn wire_compression(&self) -> Option<(Vec<String>, Vec<String>)> {
        // Compression only pays for itself across the wire.
        self.remote_connect.as_ref()?;
        self.spec.compression.as_ref().map(|program| {
            (
                vec![program.clone(), "-c".into()],
                vec![program.clone(), "-dc".into()],
            )
        })
    }

    fn ssh_command(&self, remote_pipeline: &[Vec<String>]) -> Command {
        let connect = self.remote_connect.as_ref().expect("remote side requires connect args");
        let mut command = Command::new("ssh");
        command.arg("-o").arg("BatchMode=yes");
        command.args(connect);
        command.arg(
            remote_pipeline
                .iter()
                .map(|argv| shell_join(argv))
                .collect::<Vec<_>>()
                .join(" | "),
        );
        command
    }

    fn sender_is_remote(&self) -> bool {
        self.remote_connect.is_some() && self.spec.direction == ReplicationDirection::Pull
    }

    fn receiver_is_remote(&self) -> bool {
        self.remote_connect.is_some() && self.spec.direction == ReplicationDirection::Push
    }

    /// Dry-run the send to learn the stream size. Estimation failures are
    /// never fatal; the stream just reports without a total.
    async fn estimate_total(&self) -> Option<u64> {
        let mut args = self.send_args().ok()?;
        args.insert(2, "-n".into());
        args.insert(3, "-P".into());

        let mut command = if self.sender_is_remote() {
            self.ssh_command(&[args])
        } else {
            let mut command = Command::new(&args[0]);
            command.args(&args[1..]);
            command
        };
        command.stdin(Stdio::null());

        let output = match command.output().await {
            Ok(output) => output,
            Err(error) => {
                slog_scope::debug!("send size estimation failed to spawn: {}", error);
                return None;
            }
        };
        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let size_regex = once_regex!(r"(?m)^size\t(\d+)\s*$");
        size_regex
            .captures(&combined)
            .and_then(|m| m.get(1).unwrap().as_str().parse().ok())
    }
}

#[async_trait]
impl ReplicationProcess for PipeReplicationProcess {
    fn add_progress_observer(&mut self, observer: ProgressObserver) {
        self.observers.push(observer);
    }

    async fn run(&mut self) -> Result<()> {
        let total = self.estimate_total().await;
        let send_args = self.send_args()?;
        let recv_args = self.recv_args();
        let compression = self.wire_compression();

        let mut sender = if self.sender_is_remote() {
            let mut pipeline = vec![send_args];
            if let Some((compress, _)) = &compression {
                pipeline.push(compress.clone());
            }
            self.ssh_command(&pipeline)
        } else {
            let mut command = Command::new(&send_args[0]);
            command.args(&send_args[1..]);
            command
        };
        sender.stdin(Stdio::null());
        sender.stdout(Stdio::piped());
        sender.stderr(Stdio::piped());

        let mut receiver = if self.receiver_is_remote() {
            let mut pipeline = Vec::new();
            if let Some((_, decompress)) = &compression {
                pipeline.push(decompress.clone());
            }
            pipeline.push(recv_args);
            self.ssh_command(&pipeline)
        } else {
            let mut command = Command::new(&recv_args[0]);
            command.args(&recv_args[1..]);
            command
        };
        receiver.stdin(Stdio::piped());
        receiver.stdout(Stdio::null());
        receiver.stderr(Stdio::piped());

        let mut sender = sender.kill_on_drop(true).spawn().context("failed to spawn send process")?;
        let mut receiver = receiver
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn receive process")?;

        let sender_out = sender.stdout.take().expect("stdout is piped");
        let receiver_in = receiver.stdin.take().expect("stdin is piped");

        // Progress always counts logical stream bytes, so the local wire
        // stage sits on the compressed side of the pump.
        let pumped = if self.sender_is_remote() && compression.is_some() {
            // Pull: the remote send is compressed; decompress before the
            // local receive.
            let (_, decompress) = compression.as_ref().unwrap();
            let mut stage = spawn_stage(decompress)?;
            let mut stage_in = stage.stdin.take().expect("stdin is piped");
            let stage_out = stage.stdout.take().expect("stdout is piped");

            let feed = tokio::spawn(async move {
                let mut sender_out = sender_out;
                let _ = tokio::io::copy(&mut sender_out, &mut stage_in).await;
                let _ = stage_in.shutdown().await;
            });
            let pumped = pump(stage_out, receiver_in, &self.observers, total, self.spec.speed_limit).await;
            let _ = feed.await;
            let _ = stage.wait().await;
            pumped
        } else if self.receiver_is_remote() && compression.is_some() {
            // Push: compress before the wire; the remote receive pipeline
            // decompresses.
            let (compress, _) = compression.as_ref().unwrap();
            let mut stage = spawn_stage(compress)?;
            let stage_in = stage.stdin.take().expect("stdin is piped");
            let mut stage_out = stage.stdout.take().expect("stdout is piped");

            let drain = tokio::spawn(async move {
                let mut receiver_in = receiver_in;
                let _ = tokio::io::copy(&mut stage_out, &mut receiver_in).await;
                let _ = receiver_in.shutdown().await;
            });
            let pumped = pump(sender_out, stage_in, &self.observers, total, self.spec.speed_limit).await;
            let _ = stage.wait().await;
            let _ = drain.await;
            pumped
        } else {
            pump(sender_out, receiver_in, &self.observers, total, self.spec.speed_limit).await
        };

        let sender_status = sender.wait().await.context("waiting for send process failed")?;
        let sender_stderr = read_stderr(sender.stderr.take()).await;
        let receiver_status = receiver.wait().await.context("waiting for receive process failed")?;
        let receiver_stderr = read_stderr(receiver.stderr.take()).await;

        // A verdict from the remote half arrived through ssh, so its
        // stderr decides whether the failure is worth retrying.
        verdict("zfs send", sender_status, &sender_stderr)
            .map_err(|e| if self.sender_is_remote() { classify_ssh_error(e) } else { e })
            .with_context(|| {
                format!(
                    "sending {}@{} failed",
                    self.spec.src_dataset,
                    self.spec.snapshot.as_deref().unwrap_or("?")
                )
            })?;
        verdict("zfs receive", receiver_status, &receiver_stderr)
            .map_err(|e| if self.receiver_is_remote() { classify_ssh_error(e) } else { e })?;
        let bytes_sent = pumped?;
        slog_scope::debug!("replication stream finished after {} bytes", bytes_sent);
        Ok(())
    }
}

fn spawn_stage(argv: &[String]) -> Result<tokio::process::Child> {
    let mut stage = Command::new(&argv[0]);
    stage.args(&argv[1..]);
    stage.stdin(Stdio::piped());
    stage.stdout(Stdio::piped());
    stage.stderr(Stdio::null());
    stage
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn wire stage {}", argv[0]))
}

async fn read_stderr<R: AsyncRead + Unpin>(stderr: Option<R>) -> String {
    match stderr {
        Some(mut reader) => {
            let mut buffer = String::new();
            let _ = reader.read_to_string(&mut buffer).await;
            buffer
        }
        None => String::new(),
    }
}

/// Move the stream one buffer at a time, reporting and throttling as it
/// goes. Returns the byte count so callers can log it.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    observers: &[ProgressObserver],
    total: Option<u64>,
    speed_limit: Option<u64>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let started = Instant::now();
    let mut bytes_sent: u64 = 0;
    let mut buf = BytesMut::with_capacity(1024 * 256);
    loop {
        let size = reader.read_buf(&mut buf).await.context("reading send stream failed")?;
        if size == 0 {
            break;
        }
        writer.write_all(&buf).await.context("writing receive stream failed")?;
        buf.clear();
        bytes_sent += size as u64;

        for observer in observers {
            observer(bytes_sent, total);
        }

        if let Some(limit) = speed_limit {
            let expected = Duration::from_secs_f64(bytes_sent as f64 / limit as f64);
            let elapsed = started.elapsed();
            if expected > elapsed {
                tokio::time::sleep(expected - elapsed).await;
            }
        }
    }
    writer.shutdown().await.context("closing receive stream failed")?;
    Ok(bytes_sent)
}
