use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

pub const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";

/// Delivers the end-of-run report.
pub trait Notifier {
    fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    pub sendmail: PathBuf,
    pub from: String,
    pub to: String,
    pub attempts: u32,
    pub pause: Duration,
}

impl SendmailNotifier {
    pub fn new(to: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            sendmail: PathBuf::from(DEFAULT_SENDMAIL),
            from: from.into(),
            to: to.into(),
            attempts: 3,
            pause: Duration::from_secs(5),
        }
    }

    fn send_once(&self, message: &str) -> Result<()> {
        let mut child = Command::new(&self.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("starting {:?}", self.sendmail))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .context("writing message to sendmail")?;
        }
        let status = child.wait().context("waiting for sendmail")?;
        if !status.success() {
            bail!("sendmail exited with {status}");
        }
        Ok(())
    }
}

impl Notifier for SendmailNotifier {
    fn notify(&self, subject: &str, body: &str) -> Result<()> {
        let message = compose(&self.from, &self.to, subject, body);
        let mut attempt = 1;
        loop {
            match self.send_once(&message) {
                Ok(()) => {
                    info!(to = %self.to, subject, "report mailed");
                    return Ok(());
                }
                Err(err) if attempt < self.attempts => {
                    warn!(attempt, error = ?err, "mail failed, retrying");
                    thread::sleep(self.pause);
                    attempt += 1;
                }
                Err(err) => return Err(err.context(format!("mail failed after {attempt} attempts"))),
            }
        }
    }
}

pub fn compose(from: &str, to: &str, subject: &str, body: &str) -> String {
    format!("From: {from}\nTo: {to}\nSubject: {subject}\n\n{body}")
}
