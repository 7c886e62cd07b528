use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start {}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for {}", program.display())]
    Wait {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exit status and combined stdout/stderr lines of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub lines: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last non-empty output line, trimmed.
    pub fn last_line(&self) -> Option<&str> {
        self.lines
            .iter()
            .rev()
            .map(|line| line.trim())
            .find(|line| !line.is_empty())
    }
}

/// Runs external commands. Blocks until the command exits.
pub trait CommandRunner {
    fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput, CommandError>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput, CommandError> {
        (**self).run(program, args)
    }
}

/// Spawns real processes, logging every output line as it arrives.
///
/// stdout and stderr are drained on separate threads into one channel so
/// neither pipe can fill up and stall the child.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: program.to_path_buf(),
                source,
            })?;

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(drain(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(drain(stderr, tx.clone()));
        }
        drop(tx);

        let mut lines = Vec::new();
        for line in rx {
            info!("{line}");
            lines.push(line);
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = child.wait().map_err(|source| CommandError::Wait {
            program: program.to_path_buf(),
            source,
        })?;
        Ok(CommandOutput {
            code: status.code(),
            lines,
        })
    }
}

/// Reads `pipe` to EOF. Bytes that are not UTF-8 are replaced rather than
/// ending the read, so the child never sees a closed pipe.
fn drain<R: Read + Send + 'static>(pipe: R, tx: mpsc::Sender<String>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let _ = tx.send(decode_line(&buf));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "reading command output failed");
                    break;
                }
            }
        }
    })
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn captures_stdout_and_stderr() {
        let out = ProcessRunner
            .run(
                Path::new("/bin/sh"),
                &["-c".to_owned(), "echo one; echo two >&2; exit 3".to_owned()],
            )
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert!(out.lines.contains(&"one".to_owned()));
        assert!(out.lines.contains(&"two".to_owned()));
    }

    #[cfg(unix)]
    #[test]
    fn drains_large_output() {
        let out = ProcessRunner
            .run(
                Path::new("/bin/sh"),
                &["-c".to_owned(), "i=0; while [ $i -lt 20000 ]; do echo line$i; echo err$i >&2; i=$((i+1)); done".to_owned()],
            )
            .unwrap();
        assert!(out.success());
        assert_eq!(out.lines.len(), 40000);
    }

    #[cfg(unix)]
    #[test]
    fn invalid_utf8_does_not_stop_the_drain() {
        let out = ProcessRunner
            .run(
                Path::new("/bin/sh"),
                &["-c".to_owned(), "printf 'caf\\351\\r\\n'; i=0; while [ $i -lt 50000 ]; do echo line$i; i=$((i+1)); done; echo uuid-1234".to_owned()],
            )
            .unwrap();
        assert_eq!(out.code, Some(0));
        assert_eq!(out.lines.len(), 50002);
        assert_eq!(out.lines[0], "caf\u{fffd}");
        assert_eq!(out.last_line(), Some("uuid-1234"));
    }

    #[test]
    fn decode_line_strips_line_endings() {
        assert_eq!(decode_line(b"one\r\n"), "one");
        assert_eq!(decode_line(b"two\n"), "two");
        assert_eq!(decode_line(b"tail"), "tail");
        assert_eq!(decode_line(b"\xffx\n"), "\u{fffd}x");
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = ProcessRunner
            .run(Path::new("/nonexistent/xe"), &[])
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[test]
    fn last_line_skips_blank_lines() {
        let out = CommandOutput {
            code: Some(0),
            lines: vec!["first".into(), "  uuid-1  ".into(), "".into()],
        };
        assert_eq!(out.last_line(), Some("uuid-1"));
        assert_eq!(CommandOutput::default().last_line(), None);
    }
}
