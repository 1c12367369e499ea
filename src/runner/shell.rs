use std::{fmt, os::unix::process::CommandExt as _, path::PathBuf};

use duct::cmd;
use nix::unistd::User;

use crate::config::RestartTarget;

/// A command run as a given user inside a given directory.
///
/// Arguments are passed to the program directly, never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub user: String,
    pub dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("failed looking up user `{0}`: {1}")]
    UserLookup(String, #[source] nix::Error),
    #[error("user `{0}` doesn't exist")]
    UnknownUser(String),
    #[error("failed to run `{0}`: {1}")]
    Spawn(String, #[source] std::io::Error),
    #[error("`{command}` exited with code {code}: {output}")]
    NonZeroExit {
        command: String,
        code: i32,
        output: String,
    },
}

impl Invocation {
    pub fn new(target: &RestartTarget, program: &str, args: &[&str]) -> Self {
        Self {
            user: target.user.clone(),
            dir: target.path.clone(),
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs the command and returns its combined stdout and stderr.
    pub fn run(&self) -> Result<String, ShellError> {
        let user = User::from_name(&self.user)
            .map_err(|err| ShellError::UserLookup(self.user.clone(), err))?
            .ok_or_else(|| ShellError::UnknownUser(self.user.clone()))?;
        let uid = user.uid.as_raw();
        let gid = user.gid.as_raw();

        let output = cmd(self.program.as_str(), &self.args)
            .dir(&self.dir)
            .env("HOME", &user.dir)
            .env("USER", &user.name)
            .env("LOGNAME", &user.name)
            .before_spawn(move |command| {
                command.uid(uid).gid(gid);
                Ok(())
            })
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked()
            .run()
            .map_err(|err| ShellError::Spawn(self.command_line(), err))?;

        let output_str = String::from_utf8_lossy(&output.stdout)
            .trim_end()
            .to_string();
        if output.status.success() {
            Ok(output_str)
        } else {
            Err(ShellError::NonZeroExit {
                command: self.command_line(),
                code: output.status.code().unwrap_or(-1),
                output: output_str,
            })
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` as {} in {}",
            self.command_line(),
            self.user,
            self.dir.display()
        )
    }
}
