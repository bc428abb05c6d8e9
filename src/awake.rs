use std::process::{Child, Command, Stdio};

use tracing::{debug, warn};

use crate::inspector::find_in_path;

pub struct KeepAwake {
    child: Option<Child>,
}

impl KeepAwake {
    pub fn acquire() -> Self {
        let Some(mut command) = inhibitor_command() else {
            warn!("no sleep inhibitor found; the machine may sleep during upload");
            return Self { child: None };
        };
        match command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                debug!(pid = child.id(), "sleep inhibitor started");
                Self { child: Some(child) }
            }
            Err(err) => {
                warn!(error = %err, "could not start sleep inhibitor");
                Self { child: None }
            }
        }
    }
}

impl Drop for KeepAwake {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                debug!(error = %err, "sleep inhibitor already gone");
            }
            let _ = child.wait();
        }
    }
}

fn inhibitor_command() -> Option<Command> {
    if cfg!(target_os = "macos") {
        let caffeinate = find_in_path("caffeinate")?;
        let mut command = Command::new(caffeinate);
        command
            .arg("-i")
            .arg("-w")
            .arg(std::process::id().to_string());
        return Some(command);
    }
    if cfg!(target_os = "linux") {
        let inhibit = find_in_path("systemd-inhibit")?;
        let mut command = Command::new(inhibit);
        command.args([
            "--what=idle:sleep",
            "--who=sample-upload",
            "--why=Uploading samples",
            "--mode=block",
            "sleep",
            "infinity",
        ]);
        return Some(command);
    }
    None
}
