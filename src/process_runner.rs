//! OTA Upload Tool
//! Process runner module
//!
//! External tools (the network uploader and the wired flasher) are reached
//! through [`ProcessSpawner`], so the launcher can be driven by a mock in
//! tests and by real child processes in the app.

use log::{ debug, warn };
use std::fmt;
use std::future::Future;
use std::io::{ self, PipeReader, Read };
use std::process::Stdio;
use tokio::process::{ Child, Command };
use tokio::sync::mpsc;

const READ_BUFFER_SIZE: usize = 4096;

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` if the process was killed by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {}", code),
            None => write!(f, "no exit code (terminated by signal)"),
        }
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self { code: status.code() }
    }
}

/// A running child whose combined stdout/stderr can be read as it arrives
pub trait ProcessHandle: Send {
    /// Next piece of output, `None` once both streams are closed
    fn next_chunk(&mut self) -> impl Future<Output = Option<io::Result<Vec<u8>>>> + Send;

    /// Wait for the child to terminate
    fn wait(&mut self) -> impl Future<Output = io::Result<ProcessExit>> + Send;
}

/// Capability to start external programs
pub trait ProcessSpawner: Send + Sync {
    type Handle: ProcessHandle;

    fn spawn(&self, program: &str, args: &[String]) -> io::Result<Self::Handle>;
}

/// Spawns real child processes with Tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSpawner;

type OutputChunk = io::Result<Vec<u8>>;

/// Child process whose stdout and stderr share one pipe, so output keeps
/// the order the child wrote it in
pub struct SystemProcess {
    child: Child,
    output: mpsc::UnboundedReceiver<OutputChunk>,
}

impl ProcessSpawner for SystemSpawner {
    type Handle = SystemProcess;

    fn spawn(&self, program: &str, args: &[String]) -> io::Result<SystemProcess> {
        let (reader, writer) = io::pipe()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .kill_on_drop(true);

        // Keep a console window from popping up next to the GUI
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let child = cmd.spawn()?;
        // The command still owns our copies of the write end; the reader
        // only sees EOF once they are closed
        drop(cmd);
        debug!("Spawned {} (pid {:?})", program, child.id());

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || read_output(reader, tx));

        Ok(SystemProcess { child, output: rx })
    }
}

/// Forward everything read from the pipe until EOF or the receiver is gone
fn read_output(mut reader: PipeReader, tx: mpsc::UnboundedSender<OutputChunk>) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buffer[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Reading child output failed: {}", e);
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

impl ProcessHandle for SystemProcess {
    fn next_chunk(&mut self) -> impl Future<Output = Option<OutputChunk>> + Send {
        async move { self.output.recv().await }
    }

    fn wait(&mut self) -> impl Future<Output = io::Result<ProcessExit>> + Send {
        async move {
            let status = self.child.wait().await?;
            Ok(ProcessExit::from(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_exit_success() {
        assert!(ProcessExit { code: Some(0) }.success());
        assert!(!(ProcessExit { code: Some(2) }).success());
        assert!(!(ProcessExit { code: None }).success());
    }

    #[test]
    fn test_process_exit_display() {
        assert_eq!(ProcessExit { code: Some(1) }.to_string(), "code 1");
        assert!(ProcessExit { code: None }.to_string().contains("signal"));
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = rt.enter();

        let result = SystemSpawner.spawn("definitely-not-a-real-uploader-binary", &[]);
        let err = result.err().expect("spawn should fail");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    async fn collect_output(handle: &mut SystemProcess) -> String {
        let mut out = Vec::new();
        while let Some(chunk) = handle.next_chunk().await {
            out.extend(chunk.unwrap());
        }
        String::from_utf8(out).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_and_stderr_are_merged() {
        let args = vec![
            "-c".to_string(),
            "echo to-stdout; echo to-stderr >&2; echo again-stdout".to_string()
        ];
        let mut handle = SystemSpawner.spawn("sh", &args).unwrap();

        let output = collect_output(&mut handle).await;
        let exit = handle.wait().await.unwrap();

        assert_eq!(output, "to-stdout\nto-stderr\nagain-stdout\n");
        assert!(exit.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interleaved_stdout_stderr_keep_write_order() {
        let args = vec![
            "-c".to_string(),
            "for i in 1 2 3 4 5 6 7 8; do echo out$i; echo err$i >&2; done".to_string()
        ];
        let mut handle = SystemSpawner.spawn("sh", &args).unwrap();

        let output = collect_output(&mut handle).await;
        assert!(handle.wait().await.unwrap().success());

        let expected: String = (1..=8).map(|i| format!("out{}\nerr{}\n", i, i)).collect();
        assert_eq!(output, expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_partial_lines_arrive_before_exit() {
        let args = vec!["-c".to_string(), "printf '['; sleep 0.2; printf '=]'".to_string()];
        let mut handle = SystemSpawner.spawn("sh", &args).unwrap();

        let first = handle.next_chunk().await.unwrap().unwrap();
        assert_eq!(first, b"[");

        let rest = collect_output(&mut handle).await;
        assert_eq!(rest, "=]");
        assert!(handle.wait().await.unwrap().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let args = vec!["-c".to_string(), "echo failing; exit 3".to_string()];
        let mut handle = SystemSpawner.spawn("sh", &args).unwrap();

        let output = collect_output(&mut handle).await;
        let exit = handle.wait().await.unwrap();

        assert_eq!(output, "failing\n");
        assert_eq!(exit.code, Some(3));
    }
}
