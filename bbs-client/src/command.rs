//! Task shell commands.

use anyhow::{bail, Error};

/// Run a task's shell command and log its output. Fails when the command
/// cannot be spawned or exits non-zero.
pub fn run_shell_command(command: &str) -> Result<(), Error> {
    log::info!("running command {:?}", command);

    let output = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .output()?;

    if !output.stdout.is_empty() {
        log::info!("{}", String::from_utf8_lossy(&output.stdout).trim_end());
    }
    if !output.stderr.is_empty() {
        log::warn!("{}", String::from_utf8_lossy(&output.stderr).trim_end());
    }

    if !output.status.success() {
        bail!("command {:?} failed with {}", command, output.status);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_success_and_failure() {
        assert!(run_shell_command("true").is_ok());
        assert!(run_shell_command("false").is_err());
        assert!(run_shell_command("exit 3").is_err());
    }
}
